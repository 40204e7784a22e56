//! Configuration for queues, workers, the scheduler and process roles.
//!
//! Configuration is plain serde data. It can be loaded from a TOML file,
//! from `CADENCE_*` environment variables, or both (file first, then
//! [`CadenceConfig::apply_env`] overrides).
//!
//! ```toml
//! [process]
//! role = "primary"
//!
//! [store]
//! url = "postgresql://localhost/cadence"
//!
//! [worker]
//! concurrency = 4
//! poll_interval = "500ms"
//! rate_limit = { max = 14, per = "10s" }
//!
//! [[recurring]]
//! name = "cached-data-cleanup"
//! cadence = "bihourly"
//! cron = "0 */2 * * *"
//! ```

use crate::{job::ChildJob, rate_limit::RateLimit, retry::BackoffPolicy, CadenceError};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// Serialize `std::time::Duration` as human-readable strings ("250ms", "30s", "5m").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub fn format(duration: &Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 {
            return "0s".to_string();
        }
        if millis % 1000 != 0 {
            return format!("{}ms", millis);
        }

        let secs = duration.as_secs();
        if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse a duration string like "250ms", "30s", "5m", "1h", "90".
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // Bare numbers are seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(num) = s.strip_suffix("ms") {
            let millis: u64 = num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", num))?;
            return Ok(Duration::from_millis(millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let unit = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    suffix
                ));
            }
        };
        num.checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration is too large: {}", s))
    }
}

/// Which part of the system a process runs.
///
/// Every process may enqueue. Only a primary process runs the scheduler,
/// the worker pool and recurring-job registration for its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Primary,
    #[default]
    Producer,
}

impl ProcessRole {
    pub fn is_primary(&self) -> bool {
        matches!(self, ProcessRole::Primary)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Primary => write!(f, "primary"),
            ProcessRole::Producer => write!(f, "producer"),
        }
    }
}

impl FromStr for ProcessRole {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(ProcessRole::Primary),
            "producer" => Ok(ProcessRole::Producer),
            other => Err(CadenceError::Config(format!(
                "Unknown process role '{}', expected 'primary' or 'producer'",
                other
            ))),
        }
    }
}

/// Main configuration for a process using cadence queues.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CadenceConfig {
    pub process: ProcessConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
    /// Recurring jobs declared by a primary process at start-up
    pub recurring: Vec<RecurringJobConfig>,
}

impl CadenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.process.role = role;
        self
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.store.url = url.to_string();
        self
    }

    pub fn with_queue_name(mut self, name: &str) -> Self {
        self.queue.name = name.to_string();
        self
    }

    pub fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker.concurrency = concurrency;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> crate::Result<Self> {
        Self::default().apply_env()
    }

    /// Override fields from `CADENCE_*` environment variables
    pub fn apply_env(mut self) -> crate::Result<Self> {
        if let Ok(role) = std::env::var("CADENCE_PROCESS_ROLE") {
            self.process.role = role.parse()?;
        }
        if let Ok(instance_id) = std::env::var("CADENCE_INSTANCE_ID") {
            self.process.instance_id = Some(instance_id);
        }

        if let Ok(url) = std::env::var("CADENCE_DATABASE_URL") {
            self.store.url = url;
        }
        if let Ok(pool_size) = std::env::var("CADENCE_DATABASE_POOL_SIZE") {
            self.store.pool_size = pool_size.parse().unwrap_or(self.store.pool_size);
        }

        if let Ok(name) = std::env::var("CADENCE_QUEUE_NAME") {
            self.queue.name = name;
        }

        if let Ok(concurrency) = std::env::var("CADENCE_WORKER_CONCURRENCY") {
            self.worker.concurrency = concurrency.parse().unwrap_or(self.worker.concurrency);
        }

        if let Ok(level) = std::env::var("CADENCE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = std::env::var("CADENCE_LOG_JSON") {
            self.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        Ok(self)
    }

    /// Reject values that would make the runtime misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        if self.queue.name.trim().is_empty() {
            return Err(CadenceError::Config("queue.name must not be empty".to_string()));
        }
        if self.worker.concurrency == 0 {
            return Err(CadenceError::Config(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.scheduler.lease_ttl <= self.scheduler.tick_interval {
            return Err(CadenceError::Config(
                "scheduler.lease_ttl must be longer than scheduler.tick_interval".to_string(),
            ));
        }
        for entry in &self.recurring {
            crate::cron::CronSchedule::with_timezone(
                &entry.cron,
                entry.timezone.as_deref().unwrap_or("UTC"),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProcessConfig {
    pub role: ProcessRole,
    /// Identity used as the scheduler lease holder; generated when absent
    pub instance_id: Option<String>,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub pool_size: u32,
    #[serde(with = "duration_str")]
    pub connection_timeout: Duration,
    /// Create tables on start-up if they don't exist
    pub create_tables: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/cadence".to_string(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            create_tables: true,
        }
    }
}

/// Queue-level job defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub default_attempts: u32,
    pub default_backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            default_attempts: 1,
            default_backoff: BackoffPolicy::job_default(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers pulling from the queue
    pub concurrency: usize,

    /// Sleep between polls when the queue is empty
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// A claimed job is handed back by the scheduler if its lock is not
    /// renewed within this period
    #[serde(with = "duration_str")]
    pub lock_duration: Duration,

    /// Rate limit shared by every worker in the pool
    pub rate_limit: Option<RateLimit>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            lock_duration: Duration::from_secs(30),
            rate_limit: None,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration_str")]
    pub tick_interval: Duration,
    /// How long a scheduler lease stays valid without renewal
    #[serde(with = "duration_str")]
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// Retry defaults for outbound integrations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_retries: crate::retry::DEFAULT_RETRIES,
            backoff: BackoffPolicy::rate_limit_default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: false,
        }
    }
}

/// One entry of the recurring job table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringJobConfig {
    pub name: String,
    /// Human label for the schedule, part of the idempotency key
    pub cadence: String,
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Jobs each occurrence waits for before it runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildJob>,
}
