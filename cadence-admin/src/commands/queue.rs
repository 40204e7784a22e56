use anyhow::{Result, bail};
use clap::Subcommand;
use tracing::info;

use super::CommandContext;
use crate::display::{JobTable, StatsTable};

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    #[command(about = "List ready and delayed jobs")]
    List {
        #[arg(short = 'n', long, help = "Queue name")]
        queue: Option<String>,
    },
    #[command(about = "Drop the backlog and recurring registrations of a queue")]
    Purge {
        #[arg(short = 'n', long, help = "Queue name")]
        queue: Option<String>,
        #[arg(long, help = "Confirm the operation")]
        confirm: bool,
    },
    #[command(about = "Show job counts per status")]
    Stats {
        #[arg(short = 'n', long, help = "Queue name")]
        queue: Option<String>,
    },
}

impl QueueCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<String> {
        let admin = ctx.admin();

        match self {
            QueueCommand::List { queue } => {
                let queue = ctx.queue_name(queue);
                let jobs = admin.list_ready_and_delayed(queue).await?;
                if jobs.is_empty() {
                    return Ok(format!("No ready or delayed jobs in '{}'", queue));
                }
                Ok(format!(
                    "{}\n{} job(s) waiting in '{}'",
                    JobTable::from_jobs(&jobs),
                    jobs.len(),
                    queue
                ))
            }
            QueueCommand::Purge { queue, confirm } => {
                let queue = ctx.queue_name(queue);
                if !*confirm {
                    bail!("Purging '{}' cannot be undone; pass --confirm to proceed", queue);
                }
                let removed = admin.purge_queue(queue).await?;
                info!(queue, removed, "Queue purged");
                Ok(format!("Purged {} entr(ies) from '{}'", removed, queue))
            }
            QueueCommand::Stats { queue } => {
                let queue = ctx.queue_name(queue);
                let stats = admin.queue_stats(queue).await?;
                Ok(StatsTable::from_stats(&stats).to_string())
            }
        }
    }
}
