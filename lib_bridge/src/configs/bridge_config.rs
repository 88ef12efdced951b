//! # Bridge Configuration
//!
//! Plain numeric tuning for the broadcast slot pool and the batching cache.
//! Every field has a default, so a JSON file only needs to name what it
//! overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of slots in the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 1000;
/// Initial byte capacity of every slot buffer.
pub const DEFAULT_SLOT_SIZE_BYTES: usize = 1000;
/// Max time a slot may stay FILLING before it is reclaimed.
pub const DEFAULT_MAX_LEASE_MS: u64 = 2000;
/// Minimum spacing between two re-scans of a saturated pool.
pub const DEFAULT_RETRY_WAIT_MS: u64 = 10;
/// Cache size that triggers a flush.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 100;
/// Period of the background flush.
pub const DEFAULT_CACHE_FLUSH_INTERVAL_MS: u64 = 200;
/// How long a flush waits for a slot before dropping a message.
pub const DEFAULT_CACHE_PUBLISH_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse bridge configuration: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub pool_capacity: usize,
    pub slot_size_bytes: usize,
    pub max_lease_ms: u64,
    pub retry_wait_ms: u64,
    pub cache_max_entries: usize,
    pub cache_flush_interval_ms: u64,
    pub cache_publish_timeout_ms: u64,
    /// Starts the background flush timer enabled. Tests turn it off and drive
    /// `flush()` themselves.
    pub cache_flush_enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            slot_size_bytes: DEFAULT_SLOT_SIZE_BYTES,
            max_lease_ms: DEFAULT_MAX_LEASE_MS,
            retry_wait_ms: DEFAULT_RETRY_WAIT_MS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            cache_flush_interval_ms: DEFAULT_CACHE_FLUSH_INTERVAL_MS,
            cache_publish_timeout_ms: DEFAULT_CACHE_PUBLISH_TIMEOUT_MS,
            cache_flush_enabled: true,
        }
    }
}

impl BridgeConfig {
    /// Reads a JSON file and validates it.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pool or cache cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::ZeroValue("poolCapacity"));
        }
        if self.max_lease_ms == 0 {
            return Err(ConfigError::ZeroValue("maxLeaseMs"));
        }
        if self.cache_max_entries == 0 {
            return Err(ConfigError::ZeroValue("cacheMaxEntries"));
        }
        if self.cache_flush_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("cacheFlushIntervalMs"));
        }
        Ok(())
    }

    pub fn max_lease(&self) -> Duration {
        Duration::from_millis(self.max_lease_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn cache_publish_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_publish_timeout_ms)
    }
}
