pub mod cron;
pub mod job;
pub mod queue;

pub use cron::CronCommand;
pub use job::JobCommand;
pub use queue::QueueCommand;

use cadence_queue::{Admin, CadenceConfig, JobQueue, JobStore};
use std::sync::Arc;

/// What every command runs against: the loaded configuration and an open store.
#[derive(Clone)]
pub struct CommandContext {
    pub config: CadenceConfig,
    pub store: Arc<dyn JobStore>,
}

impl CommandContext {
    pub fn new(config: CadenceConfig, store: Arc<dyn JobStore>) -> Self {
        Self { config, store }
    }

    pub fn admin(&self) -> Admin {
        Admin::new(Arc::clone(&self.store))
    }

    /// `--queue` when given, otherwise the configured queue
    pub fn queue_name<'a>(&'a self, explicit: &'a Option<String>) -> &'a str {
        explicit.as_deref().unwrap_or(&self.config.queue.name)
    }

    pub fn queue(&self, name: &str) -> JobQueue {
        let mut queue_config = self.config.queue.clone();
        queue_config.name = name.to_string();
        JobQueue::from_config(&queue_config, Arc::clone(&self.store))
    }
}
