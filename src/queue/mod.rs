//! Named queues backed by a shared job store.
//!
//! The [`JobStore`] trait is the only shared resource of the system: every
//! process enqueues through it, the scheduler promotes and fires recurring
//! jobs through it, and workers pull from it. Two implementations ship with
//! the crate: [`MemoryStore`] for tests and single-process use, and
//! `PostgresStore` (feature `postgres`) for deployments with several
//! processes.
//!
//! A [`JobQueue`] is the producer-facing handle for one queue name. It layers
//! call options over the queue defaults and acknowledges with the id of the
//! accepted job; outcomes are observable later through
//! [`JobQueue::job_status`] and [`JobQueue::job_result`].
//!
//! Workers claim jobs under a time-limited lock. A job whose lock runs out
//! (the worker crashed or hung) is picked up again by
//! [`JobStore::recover_stalled`], which the scheduler calls on every tick.

use crate::{
    Result,
    config::QueueConfig,
    events::{EventManager, JobLifecycleEvent, JobLifecycleEventType},
    job::{ChildJob, Job, JobId, JobOptions, JobStatus, RecurringJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tracing::{debug, info};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryStore, MockClock};

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Result of registering a recurring job under an existing or new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    /// Same key and same definition; nothing was written
    Unchanged,
    /// Same key, new definition; the schedule was replaced
    Updated,
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertOutcome::Created => write!(f, "created"),
            UpsertOutcome::Unchanged => write!(f, "unchanged"),
            UpsertOutcome::Updated => write!(f, "updated"),
        }
    }
}

/// Jobs moved out of Active by [`JobStore::recover_stalled`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StalledJobs {
    /// Back to Ready for another attempt
    pub requeued: u64,
    /// Out of attempts; now Failed
    pub failed: u64,
}

impl StalledJobs {
    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

pub(crate) const STALLED_MESSAGE: &str = "Job stalled: worker lock expired";

pub(crate) fn child_failed_message(child_id: JobId, child_name: &str, error_message: &str) -> String {
    format!("Child job {} ({}) failed: {}", child_id, child_name, error_message)
}

/// Storage operations shared by producers, the scheduler, workers and admin tools.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// The store's notion of the current time.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    // Jobs
    /// Insert a job. If a job with the same `dedup_key` already exists on the
    /// queue, nothing is inserted and the existing id is returned.
    async fn enqueue(&self, job: Job) -> Result<JobId>;
    /// Insert a flow parent and its children in one step. Deduplication is
    /// decided by the parent: if its key already exists, the existing id is
    /// returned and no children are inserted.
    async fn enqueue_flow(&self, parent: Job, children: Vec<Job>) -> Result<JobId>;
    /// Claim the oldest Ready job: marks it Active, counts the attempt and
    /// locks it for `lock_for`.
    async fn dequeue(&self, queue_name: &str, lock_for: Duration) -> Result<Option<Job>>;
    /// Renew the lock of an Active job. False if the job is no longer Active.
    async fn extend_lock(&self, job_id: JobId, until: DateTime<Utc>) -> Result<bool>;
    /// Hand Active jobs with an expired lock back to Ready, or fail them when
    /// no attempts remain.
    async fn recover_stalled(&self, queue_name: &str, now: DateTime<Utc>) -> Result<StalledJobs>;
    /// Completing the last pending child of a flow makes its parent Ready.
    async fn complete_job(&self, job_id: JobId, result: Option<serde_json::Value>) -> Result<()>;
    /// With `retry_at` the job goes back to Delayed; without it the failure is
    /// terminal, and a terminal child failure also fails its parent.
    async fn fail_job(
        &self,
        job_id: JobId,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Move Delayed jobs whose time has come to Ready.
    async fn promote_due_jobs(&self, queue_name: &str, now: DateTime<Utc>) -> Result<u64>;
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;
    async fn list_children(&self, parent_id: JobId) -> Result<Vec<Job>>;

    // Recurring registrations
    async fn upsert_recurring(&self, recurring: RecurringJob) -> Result<UpsertOutcome>;
    async fn due_recurring(&self, queue_name: &str, now: DateTime<Utc>)
    -> Result<Vec<RecurringJob>>;
    /// Compare-and-set of `next_run_at`; false if another scheduler got there first.
    async fn advance_recurring(
        &self,
        key: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool>;
    async fn list_recurring(&self, queue_name: &str) -> Result<Vec<RecurringJob>>;
    async fn remove_recurring(&self, key: &str) -> Result<bool>;

    // Administration
    async fn list_ready_and_delayed(&self, queue_name: &str) -> Result<Vec<Job>>;
    /// Drop Ready, Delayed and WaitingChildren jobs and the recurring
    /// registrations of a queue. Active jobs are left to finish. Returns the number of removed rows.
    async fn purge_queue(&self, queue_name: &str) -> Result<u64>;
    async fn job_counts(&self, queue_name: &str) -> Result<HashMap<JobStatus, u64>>;

    // Scheduler lease
    /// Acquire or renew the scheduler lease of a queue for `holder`.
    async fn try_acquire_lease(&self, queue_name: &str, holder: &str, ttl: Duration)
    -> Result<bool>;
    async fn release_lease(&self, queue_name: &str, holder: &str) -> Result<()>;
}

/// Acknowledgment returned by [`JobQueue::create_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAccepted {
    Job(JobId),
    Recurring { key: String, outcome: UpsertOutcome },
}

impl JobAccepted {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobAccepted::Job(id) => Some(*id),
            JobAccepted::Recurring { .. } => None,
        }
    }
}

/// Producer handle for one named queue.
#[derive(Clone)]
pub struct JobQueue {
    name: String,
    defaults: JobOptions,
    store: Arc<dyn JobStore>,
    events: Option<EventManager>,
}

impl JobQueue {
    pub fn new(name: &str, store: Arc<dyn JobStore>) -> Self {
        Self {
            name: name.to_string(),
            defaults: JobOptions::default(),
            store,
            events: None,
        }
    }

    pub fn from_config(config: &QueueConfig, store: Arc<dyn JobStore>) -> Self {
        Self::new(&config.name, store).with_defaults(
            JobOptions::new()
                .attempts(config.default_attempts)
                .backoff(config.default_backoff.clone()),
        )
    }

    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_events(mut self, events: EventManager) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn events(&self) -> Option<&EventManager> {
        self.events.as_ref()
    }

    /// Create a job on this queue.
    ///
    /// Options set on the call win over the queue defaults. A `repeat` option
    /// registers (or refreshes) a recurring job instead of enqueuing one; the
    /// registration is keyed by `job_key`, so re-declaring it is idempotent.
    pub async fn create_job(
        &self,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobAccepted> {
        self.create_flow(name, payload, Vec::new(), options).await
    }

    /// Create a parent job that becomes Ready once all `children` complete.
    ///
    /// Children run on this queue. With a `repeat` option every occurrence of
    /// the recurring job is created as such a flow.
    pub async fn create_flow(
        &self,
        name: &str,
        payload: serde_json::Value,
        children: Vec<ChildJob>,
        options: JobOptions,
    ) -> Result<JobAccepted> {
        let options = options.merged_over(&self.defaults);
        let now = self.store.now();

        if let Some(repeat) = &options.repeat {
            let key = options
                .job_key
                .clone()
                .unwrap_or_else(|| format!("{}:{}", name, repeat.cron));
            let mut recurring = RecurringJob::new(&key, &self.name, name, payload, repeat, now)?
                .with_children(children);
            if let Some(attempts) = options.attempts {
                recurring = recurring.with_max_attempts(attempts);
            }
            if let Some(backoff) = options.backoff {
                recurring = recurring.with_backoff(backoff);
            }

            let outcome = self.store.upsert_recurring(recurring).await?;
            info!(queue = %self.name, job_name = name, key = %key, %outcome, "Recurring job declared");
            return Ok(JobAccepted::Recurring { key, outcome });
        }

        let mut job = Job::new_at(&self.name, name, payload, now);
        if let Some(delay) = options.delay {
            job = job.with_delay(delay);
        }
        if let Some(attempts) = options.attempts {
            job = job.with_max_attempts(attempts);
        }
        if let Some(backoff) = options.backoff {
            job = job.with_backoff(backoff);
        }
        if let Some(key) = options.job_key {
            job = job.with_dedup_key(key);
        }

        let id = if children.is_empty() {
            self.enqueue_job(job).await?
        } else {
            let children = children.iter().map(|child| child.to_job(&job)).collect();
            let (parent, children) = job.into_flow(children);
            self.enqueue_flow(parent, children).await?
        };
        Ok(JobAccepted::Job(id))
    }

    /// Enqueue a fully built job and announce it.
    pub async fn enqueue_job(&self, job: Job) -> Result<JobId> {
        let candidate = job.id;
        let event = JobLifecycleEvent::for_job(&job, JobLifecycleEventType::Enqueued);
        let id = self.store.enqueue(job).await?;

        if id == candidate {
            debug!(queue = %self.name, job_id = %id, job_name = %event.job_name, "Job enqueued");
            if let Some(events) = &self.events {
                events.publish(event);
            }
        } else {
            debug!(queue = %self.name, job_id = %id, "Duplicate job key, keeping existing job");
        }
        Ok(id)
    }

    /// Enqueue a linked parent and children and announce them.
    pub async fn enqueue_flow(&self, parent: Job, children: Vec<Job>) -> Result<JobId> {
        let candidate = parent.id;
        let mut events = vec![JobLifecycleEvent::for_job(&parent, JobLifecycleEventType::Enqueued)];
        events.extend(
            children
                .iter()
                .map(|child| JobLifecycleEvent::for_job(child, JobLifecycleEventType::Enqueued)),
        );
        let child_count = children.len();
        let id = self.store.enqueue_flow(parent, children).await?;

        if id == candidate {
            debug!(queue = %self.name, job_id = %id, children = child_count, "Flow enqueued");
            if let Some(manager) = &self.events {
                for event in events {
                    manager.publish(event);
                }
            }
        } else {
            debug!(queue = %self.name, job_id = %id, "Duplicate flow key, keeping existing flow");
        }
        Ok(id)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    /// Children of a flow parent
    pub async fn children(&self, parent_id: JobId) -> Result<Vec<Job>> {
        self.store.list_children(parent_id).await
    }

    /// Current status of a job, if the store still has it
    pub async fn job_status(&self, job_id: JobId) -> Result<Option<JobStatus>> {
        Ok(self.store.get_job(job_id).await?.map(|job| job.status))
    }

    /// Result stored by a completed job
    pub async fn job_result(&self, job_id: JobId) -> Result<Option<serde_json::Value>> {
        Ok(self.store.get_job(job_id).await?.and_then(|job| job.result))
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
