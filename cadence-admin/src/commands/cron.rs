use anyhow::Result;
use cadence_queue::RecurringJobRegistrar;
use clap::Subcommand;

use super::CommandContext;
use crate::display::{RecurringTable, registration_summary};

#[derive(Subcommand, Debug)]
pub enum CronCommand {
    #[command(about = "Register the recurring jobs from the config table")]
    Register {
        #[arg(short = 'n', long, help = "Queue name")]
        queue: Option<String>,
    },
    #[command(about = "List recurring job registrations")]
    List {
        #[arg(short = 'n', long, help = "Queue name")]
        queue: Option<String>,
    },
}

impl CronCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<String> {
        let admin = ctx.admin();

        match self {
            CronCommand::Register { queue } => {
                let queue = ctx.queue_name(queue);
                if ctx.config.recurring.is_empty() {
                    return Ok("No recurring jobs configured".to_string());
                }
                let registrar = RecurringJobRegistrar::from_config(&ctx.config.recurring);
                let report = admin
                    .register_recurring_jobs(&ctx.queue(queue), &registrar)
                    .await?;
                Ok(registration_summary(queue, &report))
            }
            CronCommand::List { queue } => {
                let queue = ctx.queue_name(queue);
                let recurring = admin.list_recurring(queue).await?;
                if recurring.is_empty() {
                    return Ok(format!("No recurring jobs registered on '{}'", queue));
                }
                Ok(RecurringTable::from_recurring(&recurring).to_string())
            }
        }
    }
}
