//! Administrative operations used by the `cadence-admin` CLI and ops tooling.

use crate::{
    Result,
    job::{Job, JobStatus, RecurringJob},
    queue::{JobQueue, JobStore},
    registrar::{RecurringJobRegistrar, RegistrationReport},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

/// Snapshot of one queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub counts: HashMap<JobStatus, u64>,
    pub recurring: usize,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Jobs still waiting to run
    pub fn backlog(&self) -> u64 {
        self.count(JobStatus::Ready) + self.count(JobStatus::Delayed)
    }
}

#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn JobStore>,
}

impl Admin {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn list_ready_and_delayed(&self, queue_name: &str) -> Result<Vec<Job>> {
        self.store.list_ready_and_delayed(queue_name).await
    }

    /// Obliterate the backlog and recurring registrations of a queue.
    /// Jobs already running are not interrupted.
    pub async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
        let removed = self.store.purge_queue(queue_name).await?;
        warn!(queue = queue_name, removed, "Queue purged");
        Ok(removed)
    }

    /// Register the table on `queue`, which should carry the same defaults
    /// as the queue of the primary process so both write identical definitions.
    pub async fn register_recurring_jobs(
        &self,
        queue: &JobQueue,
        registrar: &RecurringJobRegistrar,
    ) -> Result<RegistrationReport> {
        registrar.validate()?;
        let report = registrar.register_all(queue).await?;
        info!(queue = %queue.name(), total = report.total(), "Recurring jobs registered by admin");
        Ok(report)
    }

    pub async fn list_recurring(&self, queue_name: &str) -> Result<Vec<RecurringJob>> {
        self.store.list_recurring(queue_name).await
    }

    pub async fn job_counts(&self, queue_name: &str) -> Result<HashMap<JobStatus, u64>> {
        self.store.job_counts(queue_name).await
    }

    pub async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats> {
        Ok(QueueStats {
            queue_name: queue_name.to_string(),
            counts: self.store.job_counts(queue_name).await?,
            recurring: self.store.list_recurring(queue_name).await?.len(),
        })
    }
}
