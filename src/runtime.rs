//! Application context: everything a process needs for one queue.
//!
//! A [`QueueRuntime`] is built once at start-up and passed to the rest of the
//! application. Every process gets the producer handle. Only a process whose
//! role is [`ProcessRole::Primary`] also registers the recurring job table,
//! starts the scheduler and runs the worker pool; the scheduler still has to
//! win the store lease before it acts, so a second primary stands by instead
//! of double-firing cron jobs.
//!
//! ```rust,no_run
//! use cadence_queue::config::{CadenceConfig, ProcessRole};
//! use cadence_queue::job::{JobFailure, JobOptions, JobOutcome};
//! use cadence_queue::queue::{JobQueue, MemoryStore};
//! use cadence_queue::registrar::RecurringJobRegistrar;
//! use cadence_queue::registry::{HandlerRegistry, JobKind, handler_fn};
//! use cadence_queue::runtime::QueueRuntime;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Kind {
//!     SendEmail,
//! }
//!
//! impl JobKind for Kind {
//!     const ALL: &'static [Self] = &[Kind::SendEmail];
//!     fn as_str(&self) -> &'static str {
//!         "send-email"
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> cadence_queue::Result<()> {
//! let config = CadenceConfig::from_env()?;
//! let queue = JobQueue::from_config(&config.queue, Arc::new(MemoryStore::new()));
//! let registry = HandlerRegistry::new().with(
//!     Kind::SendEmail,
//!     handler_fn(|_job| async { Ok::<_, JobFailure>(JobOutcome::empty()) }),
//! );
//!
//! let mut runtime = QueueRuntime::init(
//!     &config,
//!     queue,
//!     registry,
//!     RecurringJobRegistrar::from_config(&config.recurring),
//! )
//! .await?;
//!
//! runtime
//!     .queue()
//!     .create_job("send-email", json!({"to": "someone@example.com"}), JobOptions::new())
//!     .await?;
//!
//! runtime.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    config::{CadenceConfig, ProcessRole, RetryConfig},
    events::EventManager,
    queue::JobQueue,
    registrar::{RecurringJobRegistrar, RegistrationReport},
    registry::{HandlerRegistry, JobKind},
    retry::{RateLimitSignal, RetryingInvoker},
    scheduler::{Scheduler, SchedulerHandle},
    worker::WorkerPool,
};
use std::sync::Arc;
use tracing::{info, warn};

pub struct QueueRuntime<K: JobKind> {
    role: ProcessRole,
    queue: JobQueue,
    events: EventManager,
    retry: RetryConfig,
    pool: Option<WorkerPool<K>>,
    scheduler: Option<SchedulerHandle>,
    registration: Option<RegistrationReport>,
}

impl<K: JobKind> QueueRuntime<K> {
    /// Validate the handler table and bring up whatever the role calls for.
    pub async fn init(
        config: &CadenceConfig,
        queue: JobQueue,
        registry: HandlerRegistry<K>,
        registrar: RecurringJobRegistrar,
    ) -> Result<Self> {
        config.validate()?;
        registry.validate()?;
        registrar.validate()?;
        registrar.validate_names::<K>()?;

        let events = queue.events().cloned().unwrap_or_default();
        let queue = queue.with_events(events.clone());
        let role = config.process.role;

        if !role.is_primary() {
            info!(queue = %queue.name(), %role, "Queue runtime started in producer mode");
            return Ok(Self {
                role,
                queue,
                events,
                retry: config.retry.clone(),
                pool: None,
                scheduler: None,
                registration: None,
            });
        }

        let registration = registrar.register_all(&queue).await?;

        let mut scheduler = Scheduler::from_config(queue.name(), Arc::clone(queue.store()), &config.scheduler)
            .with_events(events.clone());
        if let Some(instance_id) = &config.process.instance_id {
            scheduler = scheduler.with_holder_id(instance_id.clone());
        }
        let scheduler = scheduler.spawn();

        let mut pool = WorkerPool::new(
            queue.clone(),
            Arc::new(registry),
            events.clone(),
            config.worker.clone(),
        );
        pool.start()?;

        info!(
            queue = %queue.name(),
            %role,
            concurrency = config.worker.concurrency,
            recurring = registration.total(),
            "Queue runtime started"
        );

        Ok(Self {
            role,
            queue,
            events,
            retry: config.retry.clone(),
            pool: Some(pool),
            scheduler: Some(scheduler),
            registration: Some(registration),
        })
    }

    /// Producer handle, available in every role
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventManager {
        &self.events
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Invoker for outbound calls made by handlers, set up from `[retry]`.
    pub fn retrying_invoker<E: RateLimitSignal + 'static>(&self, label: &str) -> RetryingInvoker<E> {
        RetryingInvoker::from_config(&self.retry).with_label(label)
    }

    /// What start-up registration did; `None` for producers
    pub fn registration(&self) -> Option<RegistrationReport> {
        self.registration
    }

    pub fn is_consuming(&self) -> bool {
        self.pool.as_ref().is_some_and(|pool| pool.is_running())
    }

    /// Stop workers first so in-flight jobs settle, then the scheduler.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown().await?;
        }

        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.shutdown().await {
                warn!(queue = %self.queue.name(), error = %e, "Scheduler did not stop cleanly");
                return Err(e);
            }
        }

        info!(queue = %self.queue.name(), "Queue runtime stopped");
        Ok(())
    }
}
