//! Configuration lookup for the CLI.
//!
//! Precedence, lowest first: built-in defaults, the config file, `CADENCE_*`
//! environment variables, then command-line flags (applied by the caller).

use anyhow::{Context, Result};
use cadence_queue::CadenceConfig;
use std::path::{Path, PathBuf};

/// `~/.config/cadence/config.toml` or the platform equivalent
pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir()
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Cannot find config directory"))?;

    path.push("cadence");
    path.push("config.toml");
    Ok(path)
}

/// Load the configuration. An explicit path must exist; the default path is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<CadenceConfig> {
    let config = match explicit {
        Some(path) => read_file(path)?,
        None => {
            let path = default_config_path()?;
            if path.exists() {
                read_file(&path)?
            } else {
                CadenceConfig::default()
            }
        }
    };

    config
        .apply_env()
        .context("Invalid CADENCE_* environment variable")
}

fn read_file(path: &Path) -> Result<CadenceConfig> {
    CadenceConfig::from_file(&path.to_string_lossy())
        .with_context(|| format!("Failed to load config from {}", path.display()))
}
