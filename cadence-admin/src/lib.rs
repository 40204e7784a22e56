//! # cadence-admin
//!
//! Administrative CLI for cadence job queues.
//!
//! ```bash
//! # Inspect the backlog of the configured queue
//! cadence-admin queue list
//!
//! # Counts per status for another queue
//! cadence-admin queue stats --queue reports
//!
//! # Obliterate a backlog (running jobs are not interrupted)
//! cadence-admin queue purge --queue reports --confirm
//!
//! # Declare the recurring table from the config file
//! cadence-admin cron register
//! cadence-admin cron list
//!
//! # Enqueue a job and check on it later
//! cadence-admin job enqueue send-email --payload '{"to": "someone@example.com"}' --delay 30s
//! cadence-admin job status 5f0c8d9e-2b1a-4c1e-9f5e-0a7d3c2b1e4f
//! ```
//!
//! Configuration is read from `--config`, or `~/.config/cadence/config.toml`
//! when present, and then overridden by `CADENCE_*` environment variables.

pub mod commands;
pub mod config;
pub mod display;

pub use commands::{CommandContext, CronCommand, JobCommand, QueueCommand};
