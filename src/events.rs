//! Job lifecycle events.
//!
//! Every state change a job goes through in this process is published on a
//! broadcast channel: enqueue, start, completion, retry scheduling and
//! terminal failure. Subscribers use this to observe outcomes as they happen;
//! the store keeps the final status and result for callers that poll later.
//!
//! ```rust
//! use cadence_queue::events::{EventFilter, EventManager, JobLifecycleEvent, JobLifecycleEventType};
//! use cadence_queue::job::Job;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> cadence_queue::Result<()> {
//! let events = EventManager::new(64);
//! let mut completions = events.subscribe_filtered(
//!     EventFilter::new().with_event_types(vec![JobLifecycleEventType::Completed]),
//! );
//!
//! let job = Job::new("main", "send-email", json!({}));
//! events.publish(JobLifecycleEvent::for_job(&job, JobLifecycleEventType::Started));
//! events.publish(JobLifecycleEvent::for_job(&job, JobLifecycleEventType::Completed));
//!
//! let event = completions.recv().await?;
//! assert_eq!(event.job_id, job.id);
//! # Ok(())
//! # }
//! ```

use crate::{
    CadenceError,
    job::{Job, JobFailure, JobId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobLifecycleEvent {
    pub event_id: Uuid,
    pub job_id: JobId,
    pub queue_name: String,
    pub job_name: String,
    pub event_type: JobLifecycleEventType,
    /// Attempt number the event refers to (0 before the first run)
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub processing_time_ms: Option<u64>,
    pub error: Option<JobError>,
    pub result: Option<serde_json::Value>,
    /// Set on Retrying events
    pub retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLifecycleEventType {
    Enqueued,
    Started,
    Completed,
    /// Failed with attempts left; back in Delayed until `retry_at`
    Retrying,
    /// Terminal failure
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
    pub retryable: bool,
}

impl From<&JobFailure> for JobError {
    fn from(failure: &JobFailure) -> Self {
        Self {
            message: failure.message.clone(),
            retryable: failure.retryable,
        }
    }
}

impl JobLifecycleEvent {
    pub fn for_job(job: &Job, event_type: JobLifecycleEventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            job_name: job.name.clone(),
            event_type,
            attempt: job.attempts,
            timestamp: Utc::now(),
            processing_time_ms: None,
            error: None,
            result: None,
            retry_at: None,
        }
    }

    pub fn with_processing_time(mut self, ms: u64) -> Self {
        self.processing_time_ms = Some(ms);
        self
    }

    pub fn with_error(mut self, failure: &JobFailure) -> Self {
        self.error = Some(failure.into());
        self
    }

    pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
        self.result = result;
        self
    }

    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }
}

/// Subscription filter. Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Vec<JobLifecycleEventType>,
    pub queue_names: Vec<String>,
    pub job_names: Vec<String>,
    pub job_ids: Vec<JobId>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, types: Vec<JobLifecycleEventType>) -> Self {
        self.event_types = types;
        self
    }

    pub fn with_queue_names(mut self, queue_names: Vec<String>) -> Self {
        self.queue_names = queue_names;
        self
    }

    pub fn with_job_names(mut self, job_names: Vec<String>) -> Self {
        self.job_names = job_names;
        self
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_ids.push(job_id);
        self
    }

    pub fn matches(&self, event: &JobLifecycleEvent) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.queue_names.is_empty() || self.queue_names.contains(&event.queue_name))
            && (self.job_names.is_empty() || self.job_names.contains(&event.job_name))
            && (self.job_ids.is_empty() || self.job_ids.contains(&event.job_id))
    }
}

/// Receiver that only yields events matching its filter.
#[derive(Debug)]
pub struct EventSubscription {
    pub filter: EventFilter,
    receiver: broadcast::Receiver<JobLifecycleEvent>,
}

impl EventSubscription {
    /// Next matching event. Lagging skips the overwritten events.
    pub async fn recv(&mut self) -> crate::Result<JobLifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CadenceError::Queue {
                        message: "Event channel closed".to_string(),
                    });
                }
            }
        }
    }
}

/// Broadcast hub for lifecycle events. Clones publish to the same channel.
#[derive(Debug, Clone)]
pub struct EventManager {
    sender: broadcast::Sender<JobLifecycleEvent>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: JobLifecycleEvent) {
        if let Ok(receivers) = self.sender.send(event) {
            debug!(receivers, "Published job event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobLifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            filter,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1024)
    }
}
