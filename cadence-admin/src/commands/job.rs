use anyhow::{Context, Result};
use cadence_queue::{JobAccepted, JobId, JobOptions, config::duration_str};
use clap::Subcommand;
use std::time::Duration;

use super::CommandContext;
use crate::display::JobTable;

fn parse_duration(s: &str) -> Result<Duration, String> {
    duration_str::parse(s)
}

#[derive(Subcommand, Debug)]
pub enum JobCommand {
    #[command(about = "Enqueue a job")]
    Enqueue {
        #[arg(short = 'n', long, help = "Queue name")]
        queue: Option<String>,
        #[arg(help = "Job name")]
        name: String,
        #[arg(short = 'j', long, default_value = "{}", help = "Job payload as JSON")]
        payload: String,
        #[arg(short, long, value_parser = parse_duration, help = "Delay before the job is ready (e.g. 30s, 5m)")]
        delay: Option<Duration>,
        #[arg(short, long, help = "Idempotency key")]
        key: Option<String>,
        #[arg(short, long, help = "Maximum attempts")]
        attempts: Option<u32>,
    },
    #[command(about = "Show the status and result of a job")]
    Status {
        #[arg(help = "Job ID")]
        job_id: JobId,
    },
}

impl JobCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<String> {
        match self {
            JobCommand::Enqueue {
                queue,
                name,
                payload,
                delay,
                key,
                attempts,
            } => {
                let queue = ctx.queue(ctx.queue_name(queue));
                let payload: serde_json::Value =
                    serde_json::from_str(payload).context("Payload is not valid JSON")?;

                let mut options = JobOptions::new();
                if let Some(delay) = delay {
                    options = options.delay(*delay);
                }
                if let Some(key) = key {
                    options = options.job_key(key.clone());
                }
                if let Some(attempts) = attempts {
                    options = options.attempts(*attempts);
                }

                match queue.create_job(name, payload, options).await? {
                    JobAccepted::Job(id) => Ok(format!("Accepted job {} on '{}'", id, queue.name())),
                    JobAccepted::Recurring { key, outcome } => {
                        Ok(format!("Recurring job '{}' {}", key, outcome))
                    }
                }
            }
            JobCommand::Status { job_id } => {
                let job = ctx
                    .store
                    .get_job(*job_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Job {} not found", job_id))?;

                let mut out = JobTable::from_jobs(std::slice::from_ref(&job)).to_string();
                if let Some(error) = &job.error_message {
                    out.push_str(&format!("\nLast error: {}", error));
                }
                if let Some(result) = &job.result {
                    out.push_str(&format!("\nResult: {}", result));
                }
                Ok(out)
            }
        }
    }
}
