//! Runner configuration for fleetplay
//!
//! Controls parallelism, timeouts, retries and credential policy. Loaded from
//! `fleetplay.yml`, `fleetplay.json` or `fleetplay.toml` in the config
//! directory; every field has a default so the file is optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{ConnectionSettings, RetryPolicy};
use crate::error::ConfigError;

/// How literal credentials in inventory or playbook variables are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialPolicy {
    /// Fail the run before any host is contacted
    #[default]
    Reject,
    /// Log a warning and continue
    Warn,
}

/// Retry budget for transient connection failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled each time
    pub initial_backoff_ms: u64,
    /// Upper bound on a single backoff
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Hosts processed concurrently
    pub forks: usize,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub retries: RetryConfig,
    /// Stop every host after the first host failure
    pub any_errors_fatal: bool,
    /// Prefix of environment variables injected as playbook variables
    pub env_prefix: String,
    pub plaintext_credentials: CredentialPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            forks: 5,
            connect_timeout_secs: 10,
            command_timeout_secs: 300,
            retries: RetryConfig::default(),
            any_errors_fatal: false,
            env_prefix: "FLEETPLAY_VAR_".to_string(),
            plaintext_credentials: CredentialPolicy::Reject,
        }
    }
}

impl RunnerConfig {
    /// Timeouts and retry policy handed to the connection layer
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retries.max_attempts.max(1),
                initial_backoff: Duration::from_millis(self.retries.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retries.max_backoff_ms),
            },
        }
    }
}

/// Resolve the configuration directory: explicit flag, then system, then user
pub fn default_config_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }
    let system = PathBuf::from("/etc/fleetplay");
    if system.is_dir() {
        return Some(system);
    }
    dirs::config_dir().map(|dir| dir.join("fleetplay"))
}

/// Load runner configuration from the config directory
pub fn load_runner_config(config_dir: &Path) -> Result<RunnerConfig, ConfigError> {
    let yaml_path = config_dir.join("fleetplay.yml");
    let json_path = config_dir.join("fleetplay.json");
    let toml_path = config_dir.join("fleetplay.toml");

    let path = if yaml_path.exists() {
        yaml_path
    } else if json_path.exists() {
        json_path
    } else if toml_path.exists() {
        toml_path
    } else {
        // Return default configuration if no config file exists
        return Ok(RunnerConfig::default());
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;

    let parsed: Result<RunnerConfig, String> =
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") => serde_yaml::from_str(&contents).map_err(|e| e.to_string()),
            Some("json") => serde_json::from_str(&contents).map_err(|e| e.to_string()),
            _ => toml::from_str(&contents).map_err(|e| e.to_string()),
        };

    let config = parsed.map_err(|message| ConfigError::Parse {
        path: path.clone(),
        message,
    })?;

    if config.forks == 0 {
        return Err(ConfigError::Invalid(format!(
            "{}: forks must be at least 1",
            path.display()
        )));
    }
    Ok(config)
}
