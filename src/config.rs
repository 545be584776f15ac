//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {key} = {value} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
}

fn invalid(key: &'static str, value: impl ToString, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub lock: LockConfig,
    pub queue: QueueConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lock.validate()?;
        self.queue.validate()
    }
}

/// Settings for the lock manager and the cache's interlock waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum milliseconds to spend acquiring one lock.
    pub lock_timeout_ms: u64,
    /// Number of shards in the lock table.
    pub num_key_maps: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 100,
            num_key_maps: 8,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout_ms < 1 {
            return Err(invalid(
                "lock.lock_timeout_ms",
                self.lock_timeout_ms,
                "must not be less than 1",
            ));
        }
        if self.num_key_maps < 1 {
            return Err(invalid(
                "lock.num_key_maps",
                self.num_key_maps,
                "must not be less than 1",
            ));
        }
        Ok(())
    }
}

/// Settings for the reliable request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Milliseconds without progress before declaring the peer down.
    pub max_retry_ms: u64,
    /// Sleep between reconnection attempts.
    pub retry_wait_ms: u64,
    /// Capacity of the pending (not yet sent) queue.
    pub queue_size: usize,
    /// Capacity of the sent-but-unacknowledged window; must equal or
    /// exceed `queue_size`.
    pub sent_queue_size: usize,
    /// Server-side ring of recorded acks used to answer duplicates; must
    /// equal or exceed `sent_queue_size`.
    pub ack_ring_size: usize,
    /// Checkpoint the persisted seqno every this many acks.
    pub checkpoint_interval: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retry_ms: 1000,
            retry_wait_ms: 100,
            queue_size: 100,
            sent_queue_size: 100,
            ack_ring_size: 128,
            checkpoint_interval: 1,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry_ms < 1 {
            return Err(invalid(
                "queue.max_retry_ms",
                self.max_retry_ms,
                "must not be less than 1",
            ));
        }
        if self.retry_wait_ms < 1 {
            return Err(invalid(
                "queue.retry_wait_ms",
                self.retry_wait_ms,
                "must not be less than 1",
            ));
        }
        if self.queue_size < 1 {
            return Err(invalid(
                "queue.queue_size",
                self.queue_size,
                "must not be less than 1",
            ));
        }
        if self.sent_queue_size < self.queue_size {
            return Err(invalid(
                "queue.sent_queue_size",
                self.sent_queue_size,
                "must equal or exceed queue_size",
            ));
        }
        if self.ack_ring_size < self.sent_queue_size {
            return Err(invalid(
                "queue.ack_ring_size",
                self.ack_ring_size,
                "must equal or exceed sent_queue_size",
            ));
        }
        if self.checkpoint_interval < 1 {
            return Err(invalid(
                "queue.checkpoint_interval",
                self.checkpoint_interval,
                "must not be less than 1",
            ));
        }
        Ok(())
    }
}

/// Loads and validates a config file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source: Box::new(source),
    })?;
    config.validate()?;
    Ok(config)
}
