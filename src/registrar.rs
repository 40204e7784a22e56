//! Declaration of the recurring job table at primary start-up.
//!
//! Each entry pairs a job name with a [`Cadence`]. The registration key is
//! derived from both (`"<name>-<label>"`), and registration goes through the
//! store's idempotent upsert, so declaring the same table on every deploy
//! leaves exactly one registration per entry.
//!
//! An entry with children registers a flow: every occurrence enqueues the
//! children first and the named job runs once all of them have completed.
//!
//! ```rust
//! use cadence_queue::queue::{JobQueue, MemoryStore};
//! use cadence_queue::registrar::{Cadence, RecurringJobRegistrar, RecurringJobSpec};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> cadence_queue::Result<()> {
//! let queue = JobQueue::new("main", Arc::new(MemoryStore::new()));
//! let registrar = RecurringJobRegistrar::new(vec![
//!     RecurringJobSpec::new("cached-data-cleanup", Cadence::bihourly()),
//! ]);
//!
//! let first = registrar.register_all(&queue).await?;
//! let second = registrar.register_all(&queue).await?;
//! assert_eq!(first.created, 1);
//! assert_eq!(second.unchanged, 1);
//! # Ok(())
//! # }
//! ```

use crate::{
    CadenceError, Result,
    config::RecurringJobConfig,
    cron::{CronSchedule, expressions},
    job::{ChildJob, JobOptions, RepeatOptions},
    queue::{JobAccepted, JobQueue, UpsertOutcome},
    registry::JobKind,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A named cron schedule, e.g. `bihourly` = `0 */2 * * *`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub label: String,
    pub cron: String,
}

impl Cadence {
    pub fn new(label: &str, cron: &str) -> Self {
        Self {
            label: label.to_string(),
            cron: cron.to_string(),
        }
    }

    pub fn bihourly() -> Self {
        Self::new("bihourly", expressions::EVERY_TWO_HOURS)
    }

    pub fn half_hourly() -> Self {
        Self::new("half-hourly", expressions::EVERY_THIRTY_MINUTES)
    }

    pub fn daily() -> Self {
        Self::new("daily", expressions::DAILY_AT_3AM)
    }

    pub fn monthly() -> Self {
        Self::new("monthly", expressions::MONTHLY_FIRST_AT_3AM)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJobSpec {
    pub name: String,
    pub cadence: Cadence,
    pub payload: serde_json::Value,
    pub timezone: Option<String>,
    pub children: Vec<ChildJob>,
}

impl RecurringJobSpec {
    pub fn new(name: &str, cadence: Cadence) -> Self {
        Self {
            name: name.to_string(),
            cadence,
            payload: serde_json::Value::Object(Default::default()),
            timezone: None,
            children: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(timezone.to_string());
        self
    }

    pub fn with_child(mut self, child: ChildJob) -> Self {
        self.children.push(child);
        self
    }

    /// Registration key, stable across deploys
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.cadence.label)
    }

    fn repeat(&self) -> RepeatOptions {
        let repeat = RepeatOptions::cron(&self.cadence.cron);
        match &self.timezone {
            Some(tz) => repeat.in_timezone(tz),
            None => repeat,
        }
    }
}

impl From<&RecurringJobConfig> for RecurringJobSpec {
    fn from(config: &RecurringJobConfig) -> Self {
        let mut spec = RecurringJobSpec::new(&config.name, Cadence::new(&config.cadence, &config.cron));
        if let Some(payload) = &config.payload {
            spec.payload = payload.clone();
        }
        spec.timezone = config.timezone.clone();
        spec.children = config.children.clone();
        spec
    }
}

/// Counts of what one registration pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReport {
    pub created: usize,
    pub unchanged: usize,
    pub updated: usize,
}

impl RegistrationReport {
    pub fn total(&self) -> usize {
        self.created + self.unchanged + self.updated
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecurringJobRegistrar {
    table: Vec<RecurringJobSpec>,
}

impl RecurringJobRegistrar {
    pub fn new(table: Vec<RecurringJobSpec>) -> Self {
        Self { table }
    }

    pub fn from_config(entries: &[RecurringJobConfig]) -> Self {
        Self::new(entries.iter().map(RecurringJobSpec::from).collect())
    }

    pub fn table(&self) -> &[RecurringJobSpec] {
        &self.table
    }

    /// Check every cron expression and timezone without touching the store
    pub fn validate(&self) -> Result<()> {
        for spec in &self.table {
            match &spec.timezone {
                Some(tz) => CronSchedule::with_timezone(&spec.cadence.cron, tz)?,
                None => CronSchedule::new(&spec.cadence.cron)?,
            };
        }
        Ok(())
    }

    /// Check that every entry, children included, names a known job kind.
    pub fn validate_names<K: JobKind>(&self) -> Result<()> {
        let unknown: Vec<&str> = self
            .table
            .iter()
            .flat_map(|spec| {
                std::iter::once(spec.name.as_str())
                    .chain(spec.children.iter().map(|child| child.name.as_str()))
            })
            .filter(|name| K::from_name(name).is_none())
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(CadenceError::Registry {
                message: format!("Recurring jobs name unknown job kinds: {}", unknown.join(", ")),
            })
        }
    }

    /// Upsert every entry on `queue`. Safe to call repeatedly.
    pub async fn register_all(&self, queue: &JobQueue) -> Result<RegistrationReport> {
        let mut report = RegistrationReport::default();

        for spec in &self.table {
            let options = JobOptions::new().job_key(spec.key()).repeat(spec.repeat());
            let accepted = queue
                .create_flow(&spec.name, spec.payload.clone(), spec.children.clone(), options)
                .await?;

            if let JobAccepted::Recurring { outcome, .. } = accepted {
                report.record(outcome);
            }
        }

        info!(
            queue = %queue.name(),
            created = report.created,
            unchanged = report.unchanged,
            updated = report.updated,
            "Recurring jobs registered"
        );
        Ok(report)
    }
}
