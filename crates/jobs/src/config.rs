//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NAME_VAR: &str = "FORGEGEN_SCHEDULER_NAME";
pub const WORKERS_VAR: &str = "FORGEGEN_SCHEDULER_WORKERS";
pub const POLL_MS_VAR: &str = "FORGEGEN_SCHEDULER_POLL_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {var} has invalid value `{value}`")]
    Env { var: &'static str, value: String },

    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Name for logging and worker thread names
    pub name: String,
    /// Size of the worker pool
    pub workers: usize,
    /// Upper bound on how long a blocked worker or waiter sleeps before
    /// re-checking delays, deadlines and cancellation tokens
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "forgegen".to_string(),
            workers: 4,
            poll_interval_ms: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `FORGEGEN_SCHEDULER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(name) = lookup(NAME_VAR) {
            config.name = name;
        }
        if let Some(raw) = lookup(WORKERS_VAR) {
            config.workers = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: WORKERS_VAR,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(POLL_MS_VAR) {
            config.poll_interval_ms = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: POLL_MS_VAR,
                value: raw.clone(),
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be >= 1".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
