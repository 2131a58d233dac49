//! Controller configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SnapshotError};
use crate::retry::RetryConfig;

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Tunables for the snapshot controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Polling interval between controller passes.
    pub resync_interval_ms: u64,
    /// Failure deadline applied to requests that do not set one; 0 disables.
    pub default_failure_deadline_secs: u64,
    /// Attempts made on an optimistic-concurrency conflict before giving up.
    pub conflict_retries: u32,
    /// Initial backoff between conflict retries.
    pub conflict_backoff_ms: u64,
    /// Upper bound for conflict backoff.
    pub conflict_max_backoff_ms: u64,
    /// Requests reconciled concurrently per pass.
    pub workers: usize,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval_ms: 1000,
            default_failure_deadline_secs: 300,
            conflict_retries: 5,
            conflict_backoff_ms: 10,
            conflict_max_backoff_ms: 500,
            workers: 4,
            log_format: LogFormat::Text,
        }
    }
}

impl ControllerConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ControllerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SnapshotError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(SnapshotError::Config(format!(
                    "Unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_ms == 0 {
            return Err(SnapshotError::Config(
                "resync_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(SnapshotError::Config(
                "workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Polling interval.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    /// Default failure deadline.
    pub fn default_failure_deadline(&self) -> Duration {
        Duration::from_secs(self.default_failure_deadline_secs)
    }

    /// Retry settings for conflicting writes.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.conflict_retries,
            initial_backoff: Duration::from_millis(self.conflict_backoff_ms),
            max_backoff: Duration::from_millis(self.conflict_max_backoff_ms),
            ..RetryConfig::default()
        }
    }
}
