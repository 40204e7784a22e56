//! Log subscriber set-up.

use crate::{CadenceError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CadenceError::Config(format!("Invalid log level '{}': {}", config.level, e))),
    }
}

/// Install the global fmt subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.with_target)
            .with_level(true)
            .try_init()
    };

    installed.map_err(|e| CadenceError::Config(format!("Failed to install log subscriber: {}", e)))
}
