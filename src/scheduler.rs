//! Per-queue scheduler: promotes delayed jobs, recovers stalled ones and
//! fires recurring ones.
//!
//! Only one scheduler may act for a queue at a time. Each tick first acquires
//! (or renews) a lease in the shared store; a scheduler that does not hold
//! the lease stands by and does nothing. Recurring fires are additionally
//! protected by a per-occurrence dedup key and a compare-and-set on the next
//! fire time, so even two leaders racing across a lease hand-over enqueue an
//! occurrence at most once.

use crate::{
    Result,
    config::SchedulerConfig,
    events::{EventManager, JobLifecycleEvent, JobLifecycleEventType},
    queue::JobStore,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReport {
    /// Another instance holds the lease
    Standby,
    Leader {
        /// Delayed jobs moved to Ready
        promoted: u64,
        /// Active jobs whose worker lock expired, requeued or failed
        recovered: u64,
        /// Recurring occurrences enqueued
        fired: usize,
        /// Due registrations another scheduler advanced first
        skipped: usize,
    },
}

impl TickReport {
    pub fn is_leader(&self) -> bool {
        matches!(self, TickReport::Leader { .. })
    }
}

pub struct Scheduler {
    queue_name: String,
    store: Arc<dyn JobStore>,
    holder_id: String,
    tick_interval: Duration,
    lease_ttl: Duration,
    events: Option<EventManager>,
}

impl Scheduler {
    pub fn new(queue_name: &str, store: Arc<dyn JobStore>) -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            queue_name: queue_name.to_string(),
            store,
            holder_id: format!("scheduler-{}", Uuid::new_v4()),
            tick_interval: defaults.tick_interval,
            lease_ttl: defaults.lease_ttl,
            events: None,
        }
    }

    pub fn from_config(queue_name: &str, store: Arc<dyn JobStore>, config: &SchedulerConfig) -> Self {
        Self::new(queue_name, store)
            .with_tick_interval(config.tick_interval)
            .with_lease_ttl(config.lease_ttl)
    }

    /// Identity recorded as the lease holder
    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_events(mut self, events: EventManager) -> Self {
        self.events = Some(events);
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let leader = self
            .store
            .try_acquire_lease(&self.queue_name, &self.holder_id, self.lease_ttl)
            .await?;
        if !leader {
            debug!(queue = %self.queue_name, holder = %self.holder_id, "Scheduler standing by");
            return Ok(TickReport::Standby);
        }

        let now = self.store.now();
        let promoted = self.store.promote_due_jobs(&self.queue_name, now).await?;
        if promoted > 0 {
            debug!(queue = %self.queue_name, promoted, "Promoted delayed jobs");
        }

        let stalled = self.store.recover_stalled(&self.queue_name, now).await?;
        if stalled.total() > 0 {
            warn!(
                queue = %self.queue_name,
                requeued = stalled.requeued,
                failed = stalled.failed,
                "Recovered stalled jobs"
            );
        }

        let mut fired = 0;
        let mut skipped = 0;

        for recurring in self.store.due_recurring(&self.queue_name, now).await? {
            let fire_at = recurring.next_run_at;

            // Everything missed while nobody was leader collapses into this one run
            let next = match recurring.schedule().and_then(|s| s.require_next(now)) {
                Ok(next) => next,
                Err(e) => {
                    error!(key = %recurring.key, error = %e, "Recurring job has no usable schedule");
                    continue;
                }
            };

            let (job, children) = recurring.occurrence_flow(fire_at, now);
            let candidate = job.id;
            let events: Vec<JobLifecycleEvent> = std::iter::once(&job)
                .chain(&children)
                .map(|job| JobLifecycleEvent::for_job(job, JobLifecycleEventType::Enqueued))
                .collect();
            let id = if children.is_empty() {
                self.store.enqueue(job).await?
            } else {
                self.store.enqueue_flow(job, children).await?
            };

            if !self.store.advance_recurring(&recurring.key, fire_at, next).await? {
                debug!(key = %recurring.key, "Recurring job already advanced elsewhere");
                skipped += 1;
                continue;
            }

            if id == candidate {
                info!(
                    queue = %self.queue_name,
                    key = %recurring.key,
                    job_id = %id,
                    %fire_at,
                    next_run_at = %next,
                    "Fired recurring job"
                );
                if let Some(manager) = &self.events {
                    for event in events {
                        manager.publish(event);
                    }
                }
                fired += 1;
            } else {
                skipped += 1;
            }
        }

        Ok(TickReport::Leader {
            promoted,
            recovered: stalled.total(),
            fired,
            skipped,
        })
    }

    /// Tick until shutdown, then give up the lease.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(queue = %self.queue_name, holder = %self.holder_id, "Scheduler started");
        let mut was_leader = false;

        loop {
            match self.tick().await {
                Ok(report) => {
                    if report.is_leader() != was_leader {
                        info!(
                            queue = %self.queue_name,
                            holder = %self.holder_id,
                            leader = report.is_leader(),
                            "Scheduler leadership changed"
                        );
                        was_leader = report.is_leader();
                    }
                }
                Err(e) => error!(queue = %self.queue_name, error = %e, "Scheduler tick failed"),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.tick_interval) => {}
            }
        }

        if let Err(e) = self.store.release_lease(&self.queue_name, &self.holder_id).await {
            warn!(queue = %self.queue_name, error = %e, "Failed to release scheduler lease");
        }
        info!(queue = %self.queue_name, "Scheduler stopped");
        Ok(())
    }

    /// Run on a background task
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        SchedulerHandle {
            shutdown_tx,
            handle,
        }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the task already stopped
        let _ = self.shutdown_tx.send(()).await;
        self.handle.await.map_err(|e| crate::CadenceError::Scheduler {
            message: format!("Scheduler task failed: {}", e),
        })?
    }
}
