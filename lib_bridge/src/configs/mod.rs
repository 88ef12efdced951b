//! # Configuration Modules
//!
//! Numeric tuning for the broadcast pool and the batching cache.

/// Pool and cache settings with defaults and validation.
pub mod bridge_config;

pub use bridge_config::{BridgeConfig, ConfigError};
