//! Configuration loading and representation.
//!
//! Every value has a default; the environment overrides it. Malformed values
//! are reported instead of silently falling back.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::jobs::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Read and parse `key`; `Ok(None)` when unset.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Job manager configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Size of the worker pool
    pub worker_count: usize,
    /// Fallback re-poll interval when nothing signals the dispatcher
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            name: "job-manager".to_string(),
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobManagerConfig {
    pub const WORKERS_ENV: &'static str = "COURIER_JOB_WORKERS";
    pub const POLL_MS_ENV: &'static str = "COURIER_JOB_POLL_MS";
    pub const BACKOFF_BASE_MS_ENV: &'static str = "COURIER_JOB_BACKOFF_BASE_MS";
    pub const BACKOFF_MAX_MS_ENV: &'static str = "COURIER_JOB_BACKOFF_MAX_MS";

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(workers) = env_parse::<usize>(Self::WORKERS_ENV)? {
            if workers == 0 {
                return Err(ConfigError::Invalid {
                    key: Self::WORKERS_ENV.to_string(),
                    value: workers.to_string(),
                    reason: "at least one worker is required".to_string(),
                });
            }
            config.worker_count = workers;
        }
        if let Some(ms) = env_parse::<u64>(Self::POLL_MS_ENV)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(Self::BACKOFF_BASE_MS_ENV)? {
            config.backoff.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>(Self::BACKOFF_MAX_MS_ENV)? {
            config.backoff.max_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Location of the durable job database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub job_db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            job_db_path: PathBuf::from("courier-jobs.db"),
        }
    }
}

impl StorageConfig {
    pub const JOB_DB_ENV: &'static str = "COURIER_JOB_DB";

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = env_parse::<PathBuf>(Self::JOB_DB_ENV)? {
            config.job_db_path = path;
        }
        Ok(config)
    }
}
