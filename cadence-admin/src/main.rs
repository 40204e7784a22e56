use anyhow::Result;
use cadence_queue::{JobStore, PostgresStore, config::LoggingConfig, telemetry};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, error};

use cadence_admin::commands::*;
use cadence_admin::config::load_config;

#[derive(Parser)]
#[command(name = "cadence-admin")]
#[command(about = "Administrative CLI for cadence job queues")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, env = "CADENCE_CONFIG", help = "Path to the config file")]
    config: Option<PathBuf>,

    #[arg(short = 'u', long, global = true, help = "Database connection URL")]
    database_url: Option<String>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Suppress output except errors")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Queue inspection and purging")]
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },

    #[command(about = "Recurring job registration")]
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },

    #[command(about = "Enqueue and inspect jobs")]
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(url) = &cli.database_url {
        config.store.url = url.clone();
    }

    debug!(queue = %config.queue.name, "Connecting to job store");
    let store: Arc<dyn JobStore> = Arc::new(PostgresStore::connect(&config.store).await?);
    let ctx = CommandContext::new(config, store);

    match execute_command(&cli.command, &ctx).await {
        Ok(output) => {
            if !cli.quiet {
                println!("{}", output);
            }
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn setup_logging(cli: &Cli) -> Result<()> {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    let logging = LoggingConfig {
        level: format!("cadence_admin={level},cadence_queue={level}"),
        ..Default::default()
    };
    telemetry::init_logging(&logging)?;
    Ok(())
}

async fn execute_command(command: &Commands, ctx: &CommandContext) -> Result<String> {
    match command {
        Commands::Queue { command } => command.execute(ctx).await,
        Commands::Cron { command } => command.execute(ctx).await,
        Commands::Job { command } => command.execute(ctx).await,
    }
}
