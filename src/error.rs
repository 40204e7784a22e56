use thiserror::Error;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Handler registry error: {message}")]
    Registry { message: String },

    #[error("Unrecognized job name: {name}")]
    UnknownJob { name: String },

    #[error("Cron error: {0}")]
    Cron(#[from] crate::cron::CronError),

    #[error("Rate limit error: {message}")]
    RateLimit { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<toml::de::Error> for CadenceError {
    fn from(err: toml::de::Error) -> Self {
        CadenceError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for CadenceError {
    fn from(err: toml::ser::Error) -> Self {
        CadenceError::Config(format!("TOML serialization error: {}", err))
    }
}
