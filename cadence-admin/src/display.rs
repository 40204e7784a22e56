//! Table rendering for command output.

use cadence_queue::{Job, JobStatus, QueueStats, RecurringJob, RegistrationReport};
use comfy_table::Table;
use std::fmt;

fn status_marker(status: JobStatus) -> String {
    let marker = match status {
        JobStatus::Delayed => "🕒",
        JobStatus::Ready => "🟡",
        JobStatus::Active => "🔵",
        JobStatus::WaitingChildren => "⏸️",
        JobStatus::Completed => "🟢",
        JobStatus::Failed => "🔴",
    };
    format!("{} {}", marker, status)
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}

pub struct JobTable {
    table: Table,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec!["ID", "Name", "Status", "Attempts", "Scheduled At", "Key"]);
        Self { table }
    }

    pub fn add_job(&mut self, job: &Job) {
        let id = job.id.to_string();
        self.table.add_row(vec![
            short_id(&id).to_string(),
            job.name.clone(),
            status_marker(job.status),
            format!("{}/{}", job.attempts, job.max_attempts),
            job.scheduled_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            job.dedup_key.clone().unwrap_or_default(),
        ]);
    }

    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut table = Self::new();
        for job in jobs {
            table.add_job(job);
        }
        table
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

pub struct RecurringTable {
    table: Table,
}

impl RecurringTable {
    pub fn from_recurring(recurring: &[RecurringJob]) -> Self {
        let mut table = Table::new();
        table.set_header(vec!["Key", "Job", "Cron", "Timezone", "Next Run"]);
        for r in recurring {
            table.add_row(vec![
                r.key.clone(),
                r.name.clone(),
                r.cron.clone(),
                r.timezone.clone(),
                r.next_run_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]);
        }
        Self { table }
    }
}

impl fmt::Display for RecurringTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

pub struct StatsTable {
    table: Table,
}

impl StatsTable {
    pub fn from_stats(stats: &QueueStats) -> Self {
        let mut table = Table::new();
        table.set_header(vec!["Metric", "Value"]);
        table.add_row(vec!["Queue".to_string(), stats.queue_name.clone()]);
        for status in JobStatus::ALL {
            table.add_row(vec![status_marker(status), stats.count(status).to_string()]);
        }
        table.add_row(vec!["Backlog".to_string(), stats.backlog().to_string()]);
        table.add_row(vec!["Recurring".to_string(), stats.recurring.to_string()]);
        Self { table }
    }
}

impl fmt::Display for StatsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

pub fn registration_summary(queue: &str, report: &RegistrationReport) -> String {
    format!(
        "Registered {} recurring job(s) on '{}': {} created, {} unchanged, {} updated",
        report.total(),
        queue,
        report.created,
        report.unchanged,
        report.updated
    )
}
