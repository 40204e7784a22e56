//! # Cadence
//!
//! Named job queues for deferred and recurring work, plus the two utilities
//! that usually travel with them: a retrying invoker for rate-limited
//! outbound calls and a throttled batch walker for large record sets.
//!
//! ## Features
//!
//! - **Named queues**: any process can enqueue through a [`JobQueue`] backed by a shared [`JobStore`]
//! - **Leased scheduler**: delayed jobs are promoted and cron jobs fired by a per-queue singleton holding a store lease
//! - **Worker pools**: `concurrency` workers per queue with an optional shared rate limit
//! - **Typed dispatch**: a closed [`JobKind`] enum mapped to handlers, checked at start-up
//! - **Idempotent cron registration**: recurring jobs are keyed by `{name, cadence}` and upserted
//! - **Status channel**: lifecycle events on a broadcast channel; status and results kept in the store
//! - **Rate-limit retries**: bounded exponential backoff triggered only by a rate-limit signal
//! - **Batch walker**: sequential pages with an inter-batch delay and per-item failure isolation
//!
//! ## Quick Start
//!
//! ```rust
//! use cadence_queue::{
//!     HandlerRegistry, JobFailure, JobKind, JobOptions, JobOutcome, JobQueue, JobStatus,
//!     MemoryStore, Worker, EventManager, registry::handler_fn,
//! };
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
//! let queue = JobQueue::new("main", Arc::new(MemoryStore::new()));
//! let registry = HandlerRegistry::new().with(
//!     Kind::SendEmail,
//!     handler_fn(|job| async move { Ok::<_, JobFailure>(JobOutcome::with_result(job.payload)) }),
//! );
//! registry.validate()?;
//!
//! let accepted = queue
//!     .create_job("send-email", json!({"to": "someone@example.com"}), JobOptions::new())
//!     .await?;
//! let id = accepted.job_id().unwrap();
//!
//! let worker = Worker::new(queue.clone(), Arc::new(registry), EventManager::default());
//! assert!(worker.process_next().await?);
//! assert_eq!(queue.job_status(id).await?, Some(JobStatus::Completed));
//! # Ok(())
//! # }
//! ```
//!
//! In a deployment, build a [`runtime::QueueRuntime`] instead: it validates
//! the registry and, in the primary process only, registers the recurring
//! job table and starts the scheduler and worker pool.
//!
//! ## Feature Flags
//!
//! - `postgres` - Durable [`queue::PostgresStore`] for multi-process deployments
//! - `http` - Rate-limit classification for `reqwest::Error`

pub mod admin;
pub mod config;
pub mod cron;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod rate_limit;
pub mod registrar;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
pub mod walker;
pub mod worker;

pub use admin::{Admin, QueueStats};
pub use config::{CadenceConfig, ProcessRole};
pub use cron::{CronError, CronSchedule};
pub use error::CadenceError;
pub use events::{EventFilter, EventManager, JobLifecycleEvent, JobLifecycleEventType};
pub use job::{
    ChildJob, Job, JobFailure, JobId, JobOptions, JobOutcome, JobStatus, NextJob, RecurringJob,
    RepeatOptions,
};
pub use queue::{
    JobAccepted, JobQueue, JobStore, MemoryStore, MockClock, StalledJobs, UpsertOutcome,
};
pub use rate_limit::{RateLimit, RateLimiter};
pub use registrar::{Cadence, RecurringJobRegistrar, RecurringJobSpec, RegistrationReport};
pub use registry::{HandlerRegistry, JobHandler, JobKind};
pub use retry::{BackoffPolicy, RateLimitSignal, RetryingInvoker, retry_on_rate_limit};
pub use runtime::QueueRuntime;
pub use scheduler::{Scheduler, TickReport};
pub use walker::{BatchItem, BatchRequest, BatchWalker, Page, PageSource};
pub use worker::{Worker, WorkerPool};

#[cfg(feature = "postgres")]
pub use queue::PostgresStore;

/// Convenient type alias for Results with [`CadenceError`] as the error type.
pub type Result<T> = std::result::Result<T, CadenceError>;
