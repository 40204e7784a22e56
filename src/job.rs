use crate::{
    cron::{CronError, CronSchedule},
    error::CadenceError,
    retry::BackoffPolicy,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at` (initial delay or retry backoff)
    Delayed,
    Ready,
    Active,
    /// A flow parent waiting on its children
    WaitingChildren,
    Completed,
    /// Terminal: attempts exhausted or a non-retryable failure
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Delayed,
        JobStatus::Ready,
        JobStatus::Active,
        JobStatus::WaitingChildren,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Delayed => "delayed",
            JobStatus::Ready => "ready",
            JobStatus::Active => "active",
            JobStatus::WaitingChildren => "waiting_children",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CadenceError::Queue {
                message: format!("Unknown job status: {}", s),
            })
    }
}

/// A named unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Idempotency key; at most one job per key and queue
    pub dedup_key: Option<String>,
    /// Key of the recurring registration that produced this job
    pub recurring_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// While Active: the worker's lock expires here unless renewed
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Flow parent this job reports to
    #[serde(default)]
    pub parent_id: Option<JobId>,
    /// Children that have not completed yet
    #[serde(default)]
    pub pending_children: u32,
}

impl Job {
    pub fn new(queue_name: &str, name: &str, payload: serde_json::Value) -> Self {
        Self::new_at(queue_name, name, payload, Utc::now())
    }

    /// Create a job that is Ready as of `now`
    pub fn new_at(
        queue_name: &str,
        name: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.to_string(),
            name: name.to_string(),
            payload,
            status: JobStatus::Ready,
            attempts: 0,
            max_attempts: 1,
            backoff: BackoffPolicy::job_default(),
            dedup_key: None,
            recurring_key: None,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            locked_until: None,
            finished_at: None,
            error_message: None,
            result: None,
            parent_id: None,
            pending_children: 0,
        }
    }

    /// Hold the job back for `delay` past its creation time
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if delay.is_zero() {
            return self;
        }
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.scheduled_at = self
            .created_at
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.status = JobStatus::Delayed;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn with_recurring_key(mut self, key: impl Into<String>) -> Self {
        self.recurring_key = Some(key.into());
        self
    }

    /// Turn this job into a flow parent over `children`. The parent waits in
    /// `WaitingChildren` until every child has completed.
    pub fn into_flow(mut self, children: Vec<Job>) -> (Job, Vec<Job>) {
        if children.is_empty() {
            return (self, children);
        }
        self.status = JobStatus::WaitingChildren;
        self.pending_children = u32::try_from(children.len()).unwrap_or(u32::MAX);

        let parent_id = self.id;
        let children = children
            .into_iter()
            .map(|mut child| {
                child.parent_id = Some(parent_id);
                child
            })
            .collect();
        (self, children)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Active with a lock that has run out
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.locked_until.is_some_and(|until| until <= now)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// When a retry of this job should run, given the attempt that just failed.
    pub fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.delay(self.attempts.saturating_sub(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Recurrence for a job created through [`JobOptions::repeat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepeatOptions {
    pub cron: String,
    pub timezone: Option<String>,
}

impl RepeatOptions {
    pub fn cron(expression: &str) -> Self {
        Self {
            cron: expression.to_string(),
            timezone: None,
        }
    }

    pub fn in_timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(timezone.to_string());
        self
    }
}

/// Per-call job options. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOptions {
    pub delay: Option<Duration>,
    /// Idempotency key
    pub job_key: Option<String>,
    pub repeat: Option<RepeatOptions>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn job_key(mut self, key: impl Into<String>) -> Self {
        self.job_key = Some(key.into());
        self
    }

    pub fn repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Layer these options over `defaults`; fields set here win.
    pub fn merged_over(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            delay: self.delay.or(defaults.delay),
            job_key: self.job_key.clone().or_else(|| defaults.job_key.clone()),
            repeat: self.repeat.clone().or_else(|| defaults.repeat.clone()),
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.clone().or_else(|| defaults.backoff.clone()),
        }
    }
}

/// A child of a flow. It runs on the parent's queue; `attempts` falls back to
/// the parent's setting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildJob {
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attempts: Option<u32>,
}

impl ChildJob {
    pub fn new(name: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
            attempts: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// The child job under `parent`, before it is linked by [`Job::into_flow`]
    pub fn to_job(&self, parent: &Job) -> Job {
        Job::new_at(&parent.queue_name, &self.name, self.payload.clone(), parent.created_at)
            .with_max_attempts(self.attempts.unwrap_or(parent.max_attempts))
            .with_backoff(parent.backoff.clone())
    }
}

/// A follow-up job requested by a completed handler.
#[derive(Debug, Clone, PartialEq)]
pub struct NextJob {
    pub name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
}

impl NextJob {
    pub fn new(name: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// What a successful handler hands back to the pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    /// Stored on the job and queryable through `JobQueue::job_result`
    pub result: Option<serde_json::Value>,
    pub next_jobs: Vec<NextJob>,
}

impl JobOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_result(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            next_jobs: Vec::new(),
        }
    }

    pub fn then(mut self, next: NextJob) -> Self {
        self.next_jobs.push(next);
        self
    }
}

/// A handler failure. Retryable failures go back to Delayed while attempts remain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<CadenceError> for JobFailure {
    fn from(err: CadenceError) -> Self {
        match err {
            CadenceError::Serialization(_) | CadenceError::UnknownJob { .. } => {
                JobFailure::fatal(err.to_string())
            }
            other => JobFailure::retryable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for JobFailure {
    fn from(err: serde_json::Error) -> Self {
        // A payload that does not decode will not decode on retry either
        JobFailure::fatal(format!("Invalid payload: {}", err))
    }
}

/// A cron-driven job registration, fired by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringJob {
    /// Idempotency key, e.g. `cached-data-cleanup-bihourly`
    pub key: String,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub cron: String,
    pub timezone: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Run before each occurrence; the occurrence waits for all of them
    #[serde(default)]
    pub children: Vec<ChildJob>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringJob {
    pub fn new(
        key: &str,
        queue_name: &str,
        name: &str,
        payload: serde_json::Value,
        repeat: &RepeatOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, CronError> {
        let timezone = repeat.timezone.as_deref().unwrap_or("UTC");
        let schedule = CronSchedule::with_timezone(&repeat.cron, timezone)?;
        let next_run_at = schedule.require_next(now)?;

        Ok(Self {
            key: key.to_string(),
            queue_name: queue_name.to_string(),
            name: name.to_string(),
            payload,
            cron: schedule.expression.clone(),
            timezone: schedule.timezone.clone(),
            max_attempts: 1,
            backoff: BackoffPolicy::job_default(),
            children: Vec::new(),
            next_run_at,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_children(mut self, children: Vec<ChildJob>) -> Self {
        self.children = children;
        self
    }

    pub fn schedule(&self) -> Result<CronSchedule, CronError> {
        CronSchedule::with_timezone(&self.cron, &self.timezone)
    }

    /// Same job, schedule and retry settings; bookkeeping fields are ignored.
    pub fn same_definition(&self, other: &RecurringJob) -> bool {
        self.queue_name == other.queue_name
            && self.name == other.name
            && self.payload == other.payload
            && self.cron == other.cron
            && self.timezone == other.timezone
            && self.max_attempts == other.max_attempts
            && self.backoff == other.backoff
            && self.children == other.children
    }

    pub fn occurrence_key(&self, fire_at: DateTime<Utc>) -> String {
        format!("{}@{}", self.key, fire_at.to_rfc3339())
    }

    /// The job enqueued for one fire time
    pub fn occurrence(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        Job::new_at(&self.queue_name, &self.name, self.payload.clone(), now)
            .with_max_attempts(self.max_attempts)
            .with_backoff(self.backoff.clone())
            .with_dedup_key(self.occurrence_key(fire_at))
            .with_recurring_key(self.key.clone())
    }

    /// The occurrence for one fire time together with its children
    pub fn occurrence_flow(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> (Job, Vec<Job>) {
        let parent = self.occurrence(fire_at, now);
        let children = self.children.iter().map(|child| child.to_job(&parent)).collect();
        parent.into_flow(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new_at("main", "cached-data-cleanup", json!({}), at(9, 0));
        assert_eq!(job.status, JobStatus::Ready);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.scheduled_at, job.created_at);
        assert!(job.is_due(at(9, 0)));
    }

    #[test]
    fn test_delayed_job() {
        let job = Job::new_at("main", "send-email", json!({"to": "a@b.c"}), at(9, 0))
            .with_delay(Duration::from_secs(90));
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.scheduled_at, Utc.with_ymd_and_hms(2024, 5, 1, 9, 1, 30).unwrap());
        assert!(!job.is_due(at(9, 1)));
        assert!(job.is_due(at(9, 2)));

        let zero = Job::new("main", "x", json!(null)).with_delay(Duration::ZERO);
        assert_eq!(zero.status, JobStatus::Ready);
    }

    #[test]
    fn test_retry_at_uses_backoff() {
        let mut job = Job::new_at("main", "x", json!(null), at(9, 0))
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::exponential(
                Duration::from_secs(10),
                Duration::from_secs(300),
            ));

        job.attempts = 1;
        assert!(job.has_attempts_remaining());
        assert_eq!(job.retry_at(at(9, 0)), Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 10).unwrap());

        job.attempts = 2;
        assert_eq!(job.retry_at(at(9, 0)), Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 20).unwrap());

        job.attempts = 3;
        assert!(!job.has_attempts_remaining());
    }

    #[test]
    fn test_status_codes() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("waiting".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
    }

    #[test]
    fn test_options_call_level_wins() {
        let defaults = JobOptions::new()
            .attempts(5)
            .delay(Duration::from_secs(10))
            .backoff(BackoffPolicy::job_default());
        let call = JobOptions::new().attempts(2).job_key("welcome-42");

        let merged = call.merged_over(&defaults);
        assert_eq!(merged.attempts, Some(2));
        assert_eq!(merged.delay, Some(Duration::from_secs(10)));
        assert_eq!(merged.job_key.as_deref(), Some("welcome-42"));
        assert_eq!(merged.backoff, Some(BackoffPolicy::job_default()));
        assert!(merged.repeat.is_none());
    }

    #[test]
    fn test_failure_classification() {
        let failure: JobFailure = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(!failure.retryable);

        let failure: JobFailure = CadenceError::Queue {
            message: "connection reset".to_string(),
        }
        .into();
        assert!(failure.retryable);
        assert_eq!(failure.to_string(), "Queue error: connection reset");
    }

    #[test]
    fn test_recurring_job_occurrence() {
        let recurring = RecurringJob::new(
            "cached-data-cleanup-bihourly",
            "main",
            "cached-data-cleanup",
            json!({}),
            &RepeatOptions::cron("0 */2 * * *"),
            at(3, 15),
        )
        .unwrap();

        assert_eq!(recurring.next_run_at, at(4, 0));
        assert_eq!(recurring.timezone, "UTC");

        let job = recurring.occurrence(recurring.next_run_at, at(4, 0));
        assert_eq!(job.name, "cached-data-cleanup");
        assert_eq!(job.recurring_key.as_deref(), Some("cached-data-cleanup-bihourly"));
        assert_eq!(
            job.dedup_key.as_deref(),
            Some("cached-data-cleanup-bihourly@2024-05-01T04:00:00+00:00")
        );
    }

    #[test]
    fn test_flow_links_children() {
        let parent = Job::new_at("main", "generate-user-transaction-totals", json!({}), at(9, 0))
            .with_max_attempts(3);
        let children = vec![
            ChildJob::new("global-transaction-mapper", json!({"page": 1})).to_job(&parent),
            ChildJob::new("global-transaction-mapper", json!({"page": 2}))
                .with_attempts(1)
                .to_job(&parent),
        ];

        let (parent, children) = parent.into_flow(children);
        assert_eq!(parent.status, JobStatus::WaitingChildren);
        assert_eq!(parent.pending_children, 2);
        assert!(children.iter().all(|child| child.parent_id == Some(parent.id)));
        assert!(children.iter().all(|child| child.queue_name == "main"));
        assert_eq!(children[0].max_attempts, 3);
        assert_eq!(children[1].max_attempts, 1);

        let (lonely, none) = Job::new_at("main", "x", json!(null), at(9, 0)).into_flow(Vec::new());
        assert_eq!(lonely.status, JobStatus::Ready);
        assert!(none.is_empty());
    }

    #[test]
    fn test_stalled_detection() {
        let mut job = Job::new_at("main", "x", json!(null), at(9, 0));
        assert!(!job.is_stalled(at(10, 0)));

        job.status = JobStatus::Active;
        job.locked_until = Some(at(9, 30));
        assert!(!job.is_stalled(at(9, 29)));
        assert!(job.is_stalled(at(9, 30)));
    }

    #[test]
    fn test_recurring_flow_occurrence() {
        let recurring = RecurringJob::new(
            "generate-user-transaction-totals-bihourly",
            "main",
            "generate-user-transaction-totals",
            json!({}),
            &RepeatOptions::cron("0 */2 * * *"),
            at(3, 15),
        )
        .unwrap()
        .with_children(vec![ChildJob::new("global-transaction-mapper", json!({}))]);

        let (parent, children) = recurring.occurrence_flow(at(4, 0), at(4, 0));
        assert_eq!(parent.status, JobStatus::WaitingChildren);
        assert!(parent.dedup_key.is_some());
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent_id, Some(parent.id));
        assert!(children[0].dedup_key.is_none());

        let mut plain = recurring.clone();
        plain.children.clear();
        assert!(!plain.same_definition(&recurring));
    }

    #[test]
    fn test_recurring_definition_comparison() {
        let now = at(0, 0);
        let a = RecurringJob::new("k", "main", "n", json!({}), &RepeatOptions::cron("0 3 * * *"), now)
            .unwrap();
        let mut b = RecurringJob::new(
            "k",
            "main",
            "n",
            json!({}),
            &RepeatOptions::cron("0 3 * * *"),
            at(1, 0),
        )
        .unwrap();
        assert!(a.same_definition(&b));

        b.cron = "0 4 * * *".to_string();
        assert!(!a.same_definition(&b));

        assert!(RecurringJob::new("k", "main", "n", json!({}), &RepeatOptions::cron("bad"), now).is_err());
    }
}
