//! Dispatch from job names to handlers.
//!
//! Job names form a closed set described by a [`JobKind`] enum. A
//! [`HandlerRegistry`] maps every kind to a [`JobHandler`] and is checked for
//! completeness at start-up, so a missing handler is a boot error instead of
//! a job that silently does nothing.
//!
//! ```rust
//! use cadence_queue::job::{JobFailure, JobOutcome};
//! use cadence_queue::registry::{HandlerRegistry, JobKind, handler_fn};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Kind {
//!     CachedDataCleanup,
//!     SendEmail,
//! }
//!
//! impl JobKind for Kind {
//!     const ALL: &'static [Self] = &[Kind::CachedDataCleanup, Kind::SendEmail];
//!
//!     fn as_str(&self) -> &'static str {
//!         match self {
//!             Kind::CachedDataCleanup => "cached-data-cleanup",
//!             Kind::SendEmail => "send-email",
//!         }
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     Kind::CachedDataCleanup,
//!     handler_fn(|_job| async { Ok::<_, JobFailure>(JobOutcome::empty()) }),
//! );
//! assert!(registry.validate().is_err());
//!
//! registry.register(
//!     Kind::SendEmail,
//!     handler_fn(|_job| async { Ok::<_, JobFailure>(JobOutcome::empty()) }),
//! );
//! assert!(registry.validate().is_ok());
//! ```

use crate::{
    CadenceError, Result,
    job::{Job, JobFailure, JobOutcome},
};
use async_trait::async_trait;
use std::{collections::HashMap, fmt, future::Future, hash::Hash, sync::Arc};
use tracing::{error, info};

/// A closed enumeration of job names.
pub trait JobKind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

/// Work for one job kind plus its settlement hooks.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: &Job) -> std::result::Result<JobOutcome, JobFailure>;

    async fn on_complete(&self, job: &Job, outcome: &JobOutcome) {
        info!(
            job_name = %job.name,
            job_id = %job.id,
            attempt = job.attempts,
            next_jobs = outcome.next_jobs.len(),
            finished_at = %chrono::Utc::now(),
            "Job completed"
        );
    }

    async fn on_failure(&self, job: &Job, failure: &JobFailure) {
        error!(
            job_name = %job.name,
            job_id = %job.id,
            attempt = job.attempts,
            retryable = failure.retryable,
            error = %failure,
            failed_at = %chrono::Utc::now(),
            "Job failed"
        );
    }
}

/// Adapter turning an async closure into a [`JobHandler`]
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<JobOutcome, JobFailure>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<JobOutcome, JobFailure>> + Send,
{
    async fn process(&self, job: &Job) -> std::result::Result<JobOutcome, JobFailure> {
        (self.f)(job.clone()).await
    }
}

/// Handler table for a [`JobKind`]. Read-only once the workers start.
pub struct HandlerRegistry<K: JobKind> {
    handlers: HashMap<K, Arc<dyn JobHandler>>,
}

impl<K: JobKind> HandlerRegistry<K> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for `kind`
    pub fn register<H>(&mut self, kind: K, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn with<H>(mut self, kind: K, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(kind, handler);
        self
    }

    /// Every kind must have a handler.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&'static str> = K::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(*kind))
            .map(|kind| kind.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CadenceError::Registry {
                message: format!("No handler registered for: {}", missing.join(", ")),
            })
        }
    }

    /// Look up the handler for a job name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        let kind = K::from_name(name).ok_or_else(|| CadenceError::UnknownJob {
            name: name.to_string(),
        })?;

        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| CadenceError::Registry {
                message: format!("No handler registered for: {}", kind.as_str()),
            })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<K: JobKind> Default for HandlerRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: JobKind> fmt::Debug for HandlerRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&'static str> = self.handlers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}
