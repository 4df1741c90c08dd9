//! Breaker configuration.
//!
//! Configs can be built in code or loaded from YAML/JSON. Durations are
//! written in human-readable form (`"3s"`, `"250ms"`, `"1m 30s"`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Sizing of the execution pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker threads kept alive by the pool runtime (at least one is started)
    #[serde(default)]
    pub idle_workers: usize,

    /// Operations allowed to run at the same time
    pub max_workers: usize,

    /// Operations allowed to wait for a worker slot
    #[serde(default)]
    pub queue_capacity: usize,
}

impl PoolConfig {
    /// Create a pool configuration.
    pub fn new(idle_workers: usize, max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            idle_workers,
            max_workers,
            queue_capacity,
        }
    }

    /// Operations the pool admits before refusing submissions.
    pub fn capacity(&self) -> usize {
        self.max_workers.saturating_add(self.queue_capacity)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_workers: 3,
            max_workers: 10,
            queue_capacity: 10,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Label attached to every log event of this breaker
    #[serde(default = "default_name")]
    pub name: String,

    /// Failures before opening the circuit
    pub max_failures: u32,

    /// Time an operation may run before the watchdog cancels it
    #[serde(with = "humantime_duration")]
    pub call_timeout: Duration,

    /// Time the circuit stays open before a trial call is allowed
    #[serde(with = "humantime_duration")]
    pub reset_timeout: Duration,

    /// How often the watchdog scans in-flight operations
    #[serde(with = "humantime_duration", default = "default_watchdog_interval")]
    pub watchdog_interval: Duration,

    /// Execution pool sizing
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_watchdog_interval() -> Duration {
    Duration::from_secs(1)
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            max_failures: 3,
            call_timeout: Duration::from_secs(3),
            reset_timeout: Duration::from_secs(3),
            watchdog_interval: default_watchdog_interval(),
            pool: PoolConfig::default(),
        }
    }
}

impl BreakerConfig {
    /// Create a config with the given thresholds and default pool sizing.
    pub fn new(max_failures: u32, call_timeout: Duration, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            call_timeout,
            reset_timeout,
            ..Default::default()
        }
    }

    /// Set the breaker name used in log events.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the pool sizing.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the watchdog tick period.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Parse and validate a YAML config.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file. `.json` files are read as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Check the constraints the breaker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_failures must be greater than zero".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "call_timeout must be greater than zero".to_string(),
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "watchdog_interval must be greater than zero".to_string(),
            ));
        }
        if self.pool.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_workers must be at least 1".to_string(),
            ));
        }
        if self.pool.max_workers < self.pool.idle_workers {
            return Err(ConfigError::Invalid(format!(
                "pool.max_workers ({}) must not be lower than pool.idle_workers ({})",
                self.pool.max_workers, self.pool.idle_workers
            )));
        }
        Ok(())
    }
}
