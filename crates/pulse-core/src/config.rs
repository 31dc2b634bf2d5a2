//! Bus configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PULSE_*), applied to defaults
//! - TOML configuration file

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default search paths for [`BusConfig::load`].
pub const CONFIG_PATHS: [&str; 3] = [
    "pulse.toml",
    "/etc/pulse/pulse.toml",
    "~/.config/pulse/pulse.toml",
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

/// What a full async queue does to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for space, up to `block_timeout_ms`, then reject.
    #[default]
    Block,
    /// Evict the oldest queued item to make room.
    DropOldest,
    /// Reject the incoming item.
    DropNewest,
}

impl BackpressurePolicy {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BackpressurePolicy::Block => "block",
            BackpressurePolicy::DropOldest => "drop_oldest",
            BackpressurePolicy::DropNewest => "drop_newest",
        }
    }
}

/// What happens to queued async work on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Invoke every queued work item before stopping.
    #[default]
    Drain,
    /// Drop queued work items without invoking them.
    Discard,
}

/// Bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of async delivery workers. Zero disables async delivery.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of each worker's queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Policy applied when a worker queue is full.
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// How long a producer waits under [`BackpressurePolicy::Block`].
    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,

    /// Treatment of queued work on shutdown.
    #[serde(default)]
    pub shutdown: ShutdownMode,

    /// Capacity of the collected-errors channel.
    #[serde(default = "default_error_channel_capacity")]
    pub error_channel_capacity: usize,
}

// Default value functions
fn default_worker_count() -> usize {
    std::env::var("PULSE_WORKERS")
        .ok()
        .and_then(|w| w.parse().ok())
        .unwrap_or(4)
}

fn default_queue_capacity() -> usize {
    std::env::var("PULSE_QUEUE_CAPACITY")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(1024)
}

fn default_block_timeout() -> u64 {
    100
}

fn default_error_channel_capacity() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            backpressure: BackpressurePolicy::default(),
            block_timeout_ms: default_block_timeout(),
            shutdown: ShutdownMode::default(),
            error_channel_capacity: default_error_channel_capacity(),
        }
    }
}

impl BusConfig {
    /// Set the worker count.
    #[must_use]
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the per-worker queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the backpressure policy.
    #[must_use]
    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Set the blocking enqueue timeout.
    ///
    /// Stored in whole milliseconds, rounded up so a non-zero timeout never
    /// becomes zero.
    #[must_use]
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        self.block_timeout_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    /// Set the shutdown mode.
    #[must_use]
    pub fn with_shutdown(mut self, mode: ShutdownMode) -> Self {
        self.shutdown = mode;
        self
    }

    /// Blocking enqueue timeout as a [`Duration`].
    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1"));
        }
        if self.backpressure == BackpressurePolicy::Block && self.block_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "block_timeout_ms must be positive with the block policy",
            ));
        }
        if self.error_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "error_channel_capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Load configuration from the first default path that exists, or
    /// defaults with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validated.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}
