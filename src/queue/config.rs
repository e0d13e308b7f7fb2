//! Queue configuration, built in code or loaded from environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::core::JobDefaults;
use crate::error::{QueueError, Result};
#[cfg(feature = "redis")]
use crate::storage::RedisConfig;
use crate::storage::StorageConfig;

/// Settings for a [`Queue`](crate::Queue).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Namespace for every store key
    pub key_prefix: String,
    pub storage: StorageConfig,
    /// Longest a worker blocks waiting for a job before re-checking shutdown
    pub block_timeout: Duration,
    /// How often delayed jobs are checked for promotion
    pub scheduler_interval: Duration,
    /// Settings for jobs created through the queue
    pub job_defaults: JobDefaults,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "prioq".to_string(),
            storage: StorageConfig::default(),
            block_timeout: Duration::from_secs(1),
            scheduler_interval: Duration::from_millis(500),
            job_defaults: JobDefaults::default(),
        }
    }
}

impl QueueConfig {
    /// In-memory queue with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue backed by Redis
    #[cfg(feature = "redis")]
    pub fn redis(config: RedisConfig) -> Self {
        Self::default().with_storage(StorageConfig::Redis(config))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    pub fn with_job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.job_defaults = defaults;
        self
    }

    /// Load settings from environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `PRIOQ_REDIS_URL`, `REDIS_URL` | Use Redis at this URL (memory otherwise) |
    /// | `PRIOQ_KEY_PREFIX` | Key namespace |
    /// | `PRIOQ_BLOCK_TIMEOUT_MS` | Worker block interval |
    /// | `PRIOQ_SCHEDULER_INTERVAL_MS` | Delayed job sweep interval |
    ///
    /// Unset or empty variables keep their defaults; unparsable values are
    /// configuration errors.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let parse_millis = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| QueueError::Configuration {
                        message: format!("Invalid value for {}: '{}' ({})", key, raw, e),
                    }),
                None => Ok(default),
            }
        };

        let defaults = Self::default();
        let mut config = Self {
            key_prefix: get("PRIOQ_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            block_timeout: parse_millis("PRIOQ_BLOCK_TIMEOUT_MS", defaults.block_timeout)?,
            scheduler_interval: parse_millis(
                "PRIOQ_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval,
            )?,
            ..defaults
        };

        if let Some(url) = get("PRIOQ_REDIS_URL").or_else(|| get("REDIS_URL")) {
            config.storage = redis_storage(url)?;
        }

        Ok(config)
    }
}

#[cfg(feature = "redis")]
fn redis_storage(url: String) -> Result<StorageConfig> {
    Ok(StorageConfig::Redis(RedisConfig::new().with_url(url)))
}

#[cfg(not(feature = "redis"))]
fn redis_storage(url: String) -> Result<StorageConfig> {
    Err(QueueError::Configuration {
        message: format!("Redis url '{}' given but the redis feature is disabled", url),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = QueueConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_numeric_variables() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("PRIOQ_KEY_PREFIX", "jobsvc"),
            ("PRIOQ_BLOCK_TIMEOUT_MS", "250"),
            ("PRIOQ_SCHEDULER_INTERVAL_MS", " 40 "),
        ]))
        .unwrap();

        assert_eq!(config.key_prefix, "jobsvc");
        assert_eq!(config.block_timeout, Duration::from_millis(250));
        assert_eq!(config.scheduler_interval, Duration::from_millis(40));
    }

    #[test]
    fn test_invalid_number_is_configuration_error() {
        let err = QueueConfig::from_lookup(lookup(&[("PRIOQ_BLOCK_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, QueueError::Configuration { .. }));
        assert!(err.to_string().contains("PRIOQ_BLOCK_TIMEOUT_MS"));
    }

    #[test]
    fn test_empty_variable_keeps_default() {
        let config = QueueConfig::from_lookup(lookup(&[("PRIOQ_KEY_PREFIX", "")])).unwrap();
        assert_eq!(config.key_prefix, "prioq");
    }

    #[test]
    #[cfg(feature = "redis")]
    fn test_redis_url_selects_redis() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://fallback:6379"),
            ("PRIOQ_REDIS_URL", "redis://primary:6379"),
        ]))
        .unwrap();

        match config.storage {
            StorageConfig::Redis(redis) => assert_eq!(redis.url, "redis://primary:6379"),
            other => panic!("expected redis storage, got {:?}", other),
        }
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::new()
            .with_key_prefix("q")
            .with_block_timeout(Duration::from_millis(50))
            .with_scheduler_interval(Duration::from_millis(20));
        assert_eq!(config.key_prefix, "q");
        assert_eq!(config.block_timeout, Duration::from_millis(50));
        assert_eq!(config.scheduler_interval, Duration::from_millis(20));
    }
}
