//! In-memory job store.
//!
//! `MemoryStore` keeps jobs, recurring registrations and scheduler leases in
//! process memory. Clones share the same state, so one store can be handed to
//! producers, the scheduler and a worker pool inside a single process. Pair it
//! with a [`MockClock`] to drive delayed jobs and cron schedules from tests.
//!
//! ```rust
//! use cadence_queue::job::{Job, JobStatus};
//! use cadence_queue::queue::{JobStore, MemoryStore, MockClock};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> cadence_queue::Result<()> {
//! let clock = MockClock::new();
//! let store = MemoryStore::with_clock(clock.clone());
//!
//! let job = Job::new_at("main", "reminder", json!({}), clock.now())
//!     .with_delay(Duration::from_secs(3600));
//! let id = store.enqueue(job).await?;
//! let lock = Duration::from_secs(30);
//! assert!(store.dequeue("main", lock).await?.is_none());
//!
//! clock.advance(chrono::Duration::hours(1));
//! store.promote_due_jobs("main", clock.now()).await?;
//!
//! let job = store.dequeue("main", lock).await?.unwrap();
//! assert_eq!(job.id, id);
//! assert_eq!(job.status, JobStatus::Active);
//! # Ok(())
//! # }
//! ```

use super::{JobStore, STALLED_MESSAGE, StalledJobs, UpsertOutcome, child_failed_message};
use crate::{
    CadenceError, Result,
    job::{Job, JobId, JobStatus, RecurringJob},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::RwLock;

/// Controllable wall clock for tests.
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Start at the current time
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryStorage {
    jobs: HashMap<JobId, Job>,
    /// Insertion order, used to break ties between jobs due at the same instant
    sequence: HashMap<JobId, u64>,
    next_sequence: u64,
    recurring: HashMap<String, RecurringJob>,
    leases: HashMap<String, Lease>,
}

impl MemoryStorage {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| CadenceError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    fn insert(&mut self, job: Job) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.sequence.insert(job.id, sequence);
        self.jobs.insert(job.id, job);
    }

    /// Count a completed child against its parent; the last one releases it.
    fn child_completed(&mut self, parent_id: JobId, now: DateTime<Utc>) {
        if let Some(parent) = self.jobs.get_mut(&parent_id) {
            if parent.status != JobStatus::WaitingChildren {
                return;
            }
            parent.pending_children = parent.pending_children.saturating_sub(1);
            if parent.pending_children == 0 {
                parent.status = JobStatus::Ready;
                parent.scheduled_at = now;
            }
        }
    }

    fn child_failed(&mut self, parent_id: JobId, message: String, now: DateTime<Utc>) {
        if let Some(parent) = self.jobs.get_mut(&parent_id) {
            if parent.status == JobStatus::WaitingChildren {
                parent.status = JobStatus::Failed;
                parent.finished_at = Some(now);
                parent.error_message = Some(message);
            }
        }
    }

    fn find_by_dedup_key(&self, queue_name: &str, key: &str) -> Option<JobId> {
        self.jobs
            .values()
            .find(|job| job.queue_name == queue_name && job.dedup_key.as_deref() == Some(key))
            .map(|job| job.id)
    }

    fn next_ready(&self, queue_name: &str, now: DateTime<Utc>) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| {
                job.queue_name == queue_name
                    && job.status == JobStatus::Ready
                    && job.scheduled_at <= now
            })
            .min_by_key(|job| (job.scheduled_at, self.sequence.get(&job.id).copied()))
            .map(|job| job.id)
    }
}

/// Job store kept in process memory. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    storage: Arc<RwLock<MemoryStorage>>,
    clock: Option<MockClock>,
}

impl MemoryStore {
    /// A store that follows the system clock
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose notion of "now" is driven by `clock`
    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            storage: Arc::default(),
            clock: Some(clock),
        }
    }

    pub fn clock(&self) -> Option<&MockClock> {
        self.clock.as_ref()
    }

    /// Every job on a queue, in insertion order
    pub async fn all_jobs(&self, queue_name: &str) -> Vec<Job> {
        let storage = self.storage.read().await;
        let mut jobs: Vec<&Job> = storage
            .jobs
            .values()
            .filter(|job| job.queue_name == queue_name)
            .collect();
        jobs.sort_by_key(|job| storage.sequence.get(&job.id).copied());
        jobs.into_iter().cloned().collect()
    }

    /// Current lease holder of a queue's scheduler, if the lease is live
    pub async fn lease_holder(&self, queue_name: &str) -> Option<String> {
        let now = self.now();
        let storage = self.storage.read().await;
        storage
            .leases
            .get(queue_name)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.holder.clone())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        match &self.clock {
            Some(clock) => clock.now(),
            None => Utc::now(),
        }
    }

    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut storage = self.storage.write().await;

        if let Some(key) = &job.dedup_key {
            if let Some(existing) = storage.find_by_dedup_key(&job.queue_name, key) {
                return Ok(existing);
            }
        }

        let id = job.id;
        storage.insert(job);
        Ok(id)
    }

    async fn enqueue_flow(&self, parent: Job, children: Vec<Job>) -> Result<JobId> {
        let mut storage = self.storage.write().await;

        if let Some(key) = &parent.dedup_key {
            if let Some(existing) = storage.find_by_dedup_key(&parent.queue_name, key) {
                return Ok(existing);
            }
        }

        let id = parent.id;
        storage.insert(parent);
        for child in children {
            storage.insert(child);
        }
        Ok(id)
    }

    async fn dequeue(&self, queue_name: &str, lock_for: Duration) -> Result<Option<Job>> {
        let now = self.now();
        let locked_until = lock_deadline(now, lock_for)?;
        let mut storage = self.storage.write().await;

        let Some(job_id) = storage.next_ready(queue_name, now) else {
            return Ok(None);
        };

        let job = storage.job_mut(job_id)?;
        job.status = JobStatus::Active;
        job.started_at = Some(now);
        job.locked_until = Some(locked_until);
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn extend_lock(&self, job_id: JobId, until: DateTime<Utc>) -> Result<bool> {
        let mut storage = self.storage.write().await;
        match storage.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Active => {
                job.locked_until = Some(until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stalled(&self, queue_name: &str, now: DateTime<Utc>) -> Result<StalledJobs> {
        let mut storage = self.storage.write().await;
        let mut recovered = StalledJobs::default();
        let mut orphaned = Vec::new();

        for job in storage.jobs.values_mut() {
            if job.queue_name != queue_name || !job.is_stalled(now) {
                continue;
            }
            job.locked_until = None;
            job.error_message = Some(STALLED_MESSAGE.to_string());
            if job.has_attempts_remaining() {
                job.status = JobStatus::Ready;
                job.scheduled_at = now;
                recovered.requeued += 1;
            } else {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                recovered.failed += 1;
                if let Some(parent_id) = job.parent_id {
                    orphaned.push((parent_id, child_failed_message(job.id, &job.name, STALLED_MESSAGE)));
                }
            }
        }

        for (parent_id, message) in orphaned {
            storage.child_failed(parent_id, message, now);
        }
        Ok(recovered)
    }

    async fn complete_job(&self, job_id: JobId, result: Option<serde_json::Value>) -> Result<()> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        let job = storage.job_mut(job_id)?;

        job.status = JobStatus::Completed;
        job.finished_at = Some(now);
        job.locked_until = None;
        job.result = result;

        if let Some(parent_id) = job.parent_id {
            storage.child_completed(parent_id, now);
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        error_message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = self.now();
        let mut storage = self.storage.write().await;
        let job = storage.job_mut(job_id)?;

        job.error_message = Some(error_message.to_string());
        job.locked_until = None;
        match retry_at {
            Some(retry_at) => {
                job.status = JobStatus::Delayed;
                job.scheduled_at = retry_at;
            }
            None => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                if let Some(parent_id) = job.parent_id {
                    let message = child_failed_message(job.id, &job.name, error_message);
                    storage.child_failed(parent_id, message, now);
                }
            }
        }
        Ok(())
    }

    async fn promote_due_jobs(&self, queue_name: &str, now: DateTime<Utc>) -> Result<u64> {
        let mut storage = self.storage.write().await;
        let mut promoted = 0;

        for job in storage.jobs.values_mut() {
            if job.queue_name == queue_name
                && job.status == JobStatus::Delayed
                && job.scheduled_at <= now
            {
                job.status = JobStatus::Ready;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let storage = self.storage.read().await;
        Ok(storage.jobs.get(&job_id).cloned())
    }

    async fn list_children(&self, parent_id: JobId) -> Result<Vec<Job>> {
        let storage = self.storage.read().await;
        let mut children: Vec<&Job> = storage
            .jobs
            .values()
            .filter(|job| job.parent_id == Some(parent_id))
            .collect();
        children.sort_by_key(|job| storage.sequence.get(&job.id).copied());
        Ok(children.into_iter().cloned().collect())
    }

    async fn upsert_recurring(&self, recurring: RecurringJob) -> Result<UpsertOutcome> {
        let mut storage = self.storage.write().await;

        match storage.recurring.get_mut(&recurring.key) {
            None => {
                storage.recurring.insert(recurring.key.clone(), recurring);
                Ok(UpsertOutcome::Created)
            }
            Some(existing) if existing.same_definition(&recurring) => Ok(UpsertOutcome::Unchanged),
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = RecurringJob {
                    created_at,
                    ..recurring
                };
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn due_recurring(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringJob>> {
        let storage = self.storage.read().await;
        let mut due: Vec<RecurringJob> = storage
            .recurring
            .values()
            .filter(|r| r.queue_name == queue_name && r.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.key.cmp(&b.key)));
        Ok(due)
    }

    async fn advance_recurring(
        &self,
        key: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let now = self.now();
        let mut storage = self.storage.write().await;

        match storage.recurring.get_mut(key) {
            Some(recurring) if recurring.next_run_at == expected_next => {
                recurring.next_run_at = next;
                recurring.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_recurring(&self, queue_name: &str) -> Result<Vec<RecurringJob>> {
        let storage = self.storage.read().await;
        let mut recurring: Vec<RecurringJob> = storage
            .recurring
            .values()
            .filter(|r| r.queue_name == queue_name)
            .cloned()
            .collect();
        recurring.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(recurring)
    }

    async fn remove_recurring(&self, key: &str) -> Result<bool> {
        let mut storage = self.storage.write().await;
        Ok(storage.recurring.remove(key).is_some())
    }

    async fn list_ready_and_delayed(&self, queue_name: &str) -> Result<Vec<Job>> {
        let storage = self.storage.read().await;
        let mut jobs: Vec<&Job> = storage
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == queue_name
                    && matches!(job.status, JobStatus::Ready | JobStatus::Delayed)
            })
            .collect();
        jobs.sort_by_key(|job| (job.scheduled_at, storage.sequence.get(&job.id).copied()));
        Ok(jobs.into_iter().cloned().collect())
    }

    async fn purge_queue(&self, queue_name: &str) -> Result<u64> {
        let mut storage = self.storage.write().await;

        let doomed: Vec<JobId> = storage
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == queue_name
                    && matches!(
                        job.status,
                        JobStatus::Ready | JobStatus::Delayed | JobStatus::WaitingChildren
                    )
            })
            .map(|job| job.id)
            .collect();
        for id in &doomed {
            storage.jobs.remove(id);
            storage.sequence.remove(id);
        }

        let before = storage.recurring.len();
        storage.recurring.retain(|_, r| r.queue_name != queue_name);
        let recurring_removed = before - storage.recurring.len();

        Ok((doomed.len() + recurring_removed) as u64)
    }

    async fn job_counts(&self, queue_name: &str) -> Result<HashMap<JobStatus, u64>> {
        let storage = self.storage.read().await;
        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.into_iter().map(|status| (status, 0)).collect();

        for job in storage.jobs.values().filter(|job| job.queue_name == queue_name) {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn try_acquire_lease(
        &self,
        queue_name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| CadenceError::Scheduler {
            message: format!("Invalid lease ttl: {}", e),
        })?;
        let mut storage = self.storage.write().await;

        let available = match storage.leases.get(queue_name) {
            None => true,
            Some(lease) => lease.holder == holder || lease.expires_at <= now,
        };

        if available {
            storage.leases.insert(
                queue_name.to_string(),
                Lease {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                },
            );
        }
        Ok(available)
    }

    async fn release_lease(&self, queue_name: &str, holder: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        if storage
            .leases
            .get(queue_name)
            .is_some_and(|lease| lease.holder == holder)
        {
            storage.leases.remove(queue_name);
        }
        Ok(())
    }
}

fn lock_deadline(now: DateTime<Utc>, lock_for: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(lock_for)
        .ok()
        .and_then(|lock_for| now.checked_add_signed(lock_for))
        .ok_or_else(|| CadenceError::Queue {
            message: format!("Invalid job lock duration: {:?}", lock_for),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RepeatOptions;
    use chrono::TimeZone;
    use serde_json::json;

    const LOCK: Duration = Duration::from_secs(30);

    fn clock() -> MockClock {
        MockClock::at(Utc.with_ymd_and_hms(2024, 5, 1, 3, 15, 0).unwrap())
    }

    #[test]
    fn test_mock_clock() {
        let clock = clock();
        let start = clock.now();
        clock.advance(chrono::Duration::minutes(90));
        assert_eq!((clock.now() - start).num_minutes(), 90);

        let other = clock.clone();
        other.set_time(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_marks_active() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());

        let first = store.enqueue(Job::new_at("main", "a", json!(1), clock.now())).await.unwrap();
        let second = store.enqueue(Job::new_at("main", "b", json!(2), clock.now())).await.unwrap();
        store.enqueue(Job::new_at("other", "c", json!(3), clock.now())).await.unwrap();

        let job = store.dequeue("main", LOCK).await.unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.started_at, Some(clock.now()));

        assert_eq!(store.dequeue("main", LOCK).await.unwrap().unwrap().id, second);
        assert!(store.dequeue("main", LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dedup_key() {
        let store = MemoryStore::new();
        let first = store
            .enqueue(Job::new("main", "a", json!({})).with_dedup_key("k"))
            .await
            .unwrap();
        let second = store
            .enqueue(Job::new("main", "a", json!({})).with_dedup_key("k"))
            .await
            .unwrap();
        let elsewhere = store
            .enqueue(Job::new("other", "a", json!({})).with_dedup_key("k"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_ne!(first, elsewhere);
        assert_eq!(store.all_jobs("main").await.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_with_and_without_retry() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let id = store
            .enqueue(Job::new_at("main", "a", json!({}), clock.now()).with_max_attempts(2))
            .await
            .unwrap();
        store.dequeue("main", LOCK).await.unwrap();

        let retry_at = clock.now() + chrono::Duration::seconds(30);
        store.fail_job(id, "boom", Some(retry_at)).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.scheduled_at, retry_at);
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        assert_eq!(store.promote_due_jobs("main", clock.now()).await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(store.promote_due_jobs("main", clock.now()).await.unwrap(), 1);

        store.dequeue("main", LOCK).await.unwrap();
        store.fail_job(id, "boom again", None).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_stores_result() {
        let store = MemoryStore::new();
        let id = store.enqueue(Job::new("main", "a", json!({}))).await.unwrap();
        store.dequeue("main", LOCK).await.unwrap();
        store.complete_job(id, Some(json!({"sent": 3}))).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"sent": 3})));

        let missing = store.complete_job(uuid::Uuid::new_v4(), None).await;
        assert!(matches!(missing, Err(CadenceError::JobNotFound { .. })));
    }

    #[tokio::test]
    async fn test_upsert_recurring_outcomes() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let make = |cron: &str| {
            RecurringJob::new(
                "cleanup-bihourly",
                "main",
                "cleanup",
                json!({}),
                &RepeatOptions::cron(cron),
                clock.now(),
            )
            .unwrap()
        };

        assert_eq!(store.upsert_recurring(make("0 */2 * * *")).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert_recurring(make("0 */2 * * *")).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert_recurring(make("0 */3 * * *")).await.unwrap(), UpsertOutcome::Updated);

        let listed = store.list_recurring("main").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cron, "0 */3 * * *");
    }

    #[tokio::test]
    async fn test_advance_recurring_is_compare_and_set() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let recurring = RecurringJob::new(
            "k",
            "main",
            "n",
            json!({}),
            &RepeatOptions::cron("0 */2 * * *"),
            clock.now(),
        )
        .unwrap();
        let expected = recurring.next_run_at;
        store.upsert_recurring(recurring).await.unwrap();

        let next = expected + chrono::Duration::hours(2);
        assert!(store.advance_recurring("k", expected, next).await.unwrap());
        assert!(!store.advance_recurring("k", expected, next).await.unwrap());
        assert!(!store.advance_recurring("missing", expected, next).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_keeps_active_jobs() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());

        let active = store.enqueue(Job::new_at("main", "a", json!({}), clock.now())).await.unwrap();
        store.dequeue("main", LOCK).await.unwrap();
        store.enqueue(Job::new_at("main", "b", json!({}), clock.now())).await.unwrap();
        store
            .enqueue(Job::new_at("main", "c", json!({}), clock.now()).with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
        store
            .upsert_recurring(
                RecurringJob::new("k", "main", "n", json!({}), &RepeatOptions::cron("0 3 * * *"), clock.now())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(store.list_ready_and_delayed("main").await.unwrap().len(), 2);
        assert_eq!(store.purge_queue("main").await.unwrap(), 3);
        assert!(store.list_ready_and_delayed("main").await.unwrap().is_empty());
        assert!(store.list_recurring("main").await.unwrap().is_empty());

        let remaining = store.get_job(active).await.unwrap().unwrap();
        assert_eq!(remaining.status, JobStatus::Active);

        let counts = store.job_counts("main").await.unwrap();
        assert_eq!(counts[&JobStatus::Active], 1);
        assert_eq!(counts[&JobStatus::Ready], 0);
    }

    #[tokio::test]
    async fn test_stalled_job_is_recovered_after_lock_expiry() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let id = store
            .enqueue(Job::new_at("main", "a", json!({}), clock.now()).with_max_attempts(2))
            .await
            .unwrap();

        let job = store.dequeue("main", LOCK).await.unwrap().unwrap();
        assert_eq!(job.locked_until, Some(clock.now() + chrono::Duration::seconds(30)));

        // still locked
        let recovered = store.recover_stalled("main", clock.now()).await.unwrap();
        assert_eq!(recovered, StalledJobs::default());

        // a renewed lock keeps the job Active past the first deadline
        let renewed = clock.now() + chrono::Duration::minutes(5);
        assert!(store.extend_lock(id, renewed).await.unwrap());
        clock.advance(chrono::Duration::minutes(1));
        assert_eq!(store.recover_stalled("main", clock.now()).await.unwrap().total(), 0);

        clock.advance(chrono::Duration::hours(24));
        let recovered = store.recover_stalled("main", clock.now()).await.unwrap();
        assert_eq!(recovered, StalledJobs { requeued: 1, failed: 0 });
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Ready);
        assert!(job.locked_until.is_none());

        // second stall uses up the last attempt
        store.dequeue("main", LOCK).await.unwrap().unwrap();
        clock.advance(chrono::Duration::minutes(1));
        let recovered = store.recover_stalled("main", clock.now()).await.unwrap();
        assert_eq!(recovered, StalledJobs { requeued: 0, failed: 1 });
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(!store.extend_lock(id, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_flow_child_failure_fails_parent() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let parent = Job::new_at("main", "totals", json!({}), clock.now());
        let children = vec![
            Job::new_at("main", "mapper", json!(1), clock.now()),
            Job::new_at("main", "mapper", json!(2), clock.now()),
        ];
        let (parent, children) = parent.into_flow(children);
        let parent_id = store.enqueue_flow(parent, children).await.unwrap();
        assert_eq!(store.list_children(parent_id).await.unwrap().len(), 2);

        let first = store.dequeue("main", LOCK).await.unwrap().unwrap();
        store.complete_job(first.id, None).await.unwrap();
        let parent = store.get_job(parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::WaitingChildren);
        assert_eq!(parent.pending_children, 1);

        let second = store.dequeue("main", LOCK).await.unwrap().unwrap();
        store.fail_job(second.id, "upstream 500", None).await.unwrap();
        let parent = store.get_job(parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, JobStatus::Failed);
        assert!(parent.error_message.unwrap().contains("upstream 500"));
        assert!(store.dequeue("main", LOCK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let clock = clock();
        let store = MemoryStore::with_clock(clock.clone());
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire_lease("main", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("main", "b", ttl).await.unwrap());
        // renewal by the holder
        assert!(store.try_acquire_lease("main", "a", ttl).await.unwrap());
        assert!(store.try_acquire_lease("email", "b", ttl).await.unwrap());

        clock.advance(chrono::Duration::seconds(31));
        assert!(store.try_acquire_lease("main", "b", ttl).await.unwrap());
        assert_eq!(store.lease_holder("main").await.as_deref(), Some("b"));

        // releasing someone else's lease is a no-op
        store.release_lease("main", "a").await.unwrap();
        assert_eq!(store.lease_holder("main").await.as_deref(), Some("b"));
        store.release_lease("main", "b").await.unwrap();
        assert!(store.lease_holder("main").await.is_none());
    }
}
