use clap::Parser;
use lib_bridge::configs::bridge_config::{self, BridgeConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 9003;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_CONFIG_FILE: &str = "server_databridge.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Signal data bridge: WebSocket broadcast server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DATABRIDGE_PORT", help = "Port to listen on for viewer and producer connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "DATABRIDGE_BIND_ADDRESS", help = "Address to bind the HTTP/WebSocket listener to.")]
    pub bind_address: Option<IpAddr>,

    #[clap(long, env = "DATABRIDGE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DATABRIDGE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DATABRIDGE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATABRIDGE_POOL_CAPACITY", help = "Number of broadcast memory slots.")]
    pub pool_capacity: Option<usize>,

    #[clap(long, env = "DATABRIDGE_SLOT_SIZE_BYTES", help = "Initial capacity of each slot buffer in bytes.")]
    pub slot_size_bytes: Option<usize>,

    #[clap(long, env = "DATABRIDGE_MAX_LEASE_MS", help = "Milliseconds after which a held slot may be reclaimed.")]
    pub max_lease_ms: Option<u64>,

    #[clap(long, env = "DATABRIDGE_RETRY_WAIT_MS", help = "Minimum milliseconds between two re-scans of a full pool.")]
    pub retry_wait_ms: Option<u64>,

    #[clap(long, env = "DATABRIDGE_CACHE_MAX_ENTRIES", help = "Cached packages that trigger a flush.")]
    pub cache_max_entries: Option<usize>,

    #[clap(long, env = "DATABRIDGE_CACHE_FLUSH_INTERVAL_MS", help = "Period of the cache flush timer in milliseconds.")]
    pub cache_flush_interval_ms: Option<u64>,

    #[clap(long, env = "DATABRIDGE_CACHE_PUBLISH_TIMEOUT_MS", help = "Slot wait of a flushed message before it is dropped.")]
    pub cache_publish_timeout_ms: Option<u64>,

    #[clap(long, env = "DATABRIDGE_CACHE_FLUSH_ENABLED", help = "Whether the flush timer publishes (true/false).")]
    pub cache_flush_enabled: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            bind_address: other.bind_address.or(self.bind_address),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            pool_capacity: other.pool_capacity.or(self.pool_capacity),
            slot_size_bytes: other.slot_size_bytes.or(self.slot_size_bytes),
            max_lease_ms: other.max_lease_ms.or(self.max_lease_ms),
            retry_wait_ms: other.retry_wait_ms.or(self.retry_wait_ms),
            cache_max_entries: other.cache_max_entries.or(self.cache_max_entries),
            cache_flush_interval_ms: other.cache_flush_interval_ms.or(self.cache_flush_interval_ms),
            cache_publish_timeout_ms: other.cache_publish_timeout_ms.or(self.cache_publish_timeout_ms),
            cache_flush_enabled: other.cache_flush_enabled.or(self.cache_flush_enabled),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(DEFAULT_PORT),
            bind_address: DEFAULT_BIND_ADDRESS.parse().ok(),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some(DEFAULT_LOG_LEVEL.to_string()),
            pool_capacity: Some(bridge_config::DEFAULT_POOL_CAPACITY),
            slot_size_bytes: Some(bridge_config::DEFAULT_SLOT_SIZE_BYTES),
            max_lease_ms: Some(bridge_config::DEFAULT_MAX_LEASE_MS),
            retry_wait_ms: Some(bridge_config::DEFAULT_RETRY_WAIT_MS),
            cache_max_entries: Some(bridge_config::DEFAULT_CACHE_MAX_ENTRIES),
            cache_flush_interval_ms: Some(bridge_config::DEFAULT_CACHE_FLUSH_INTERVAL_MS),
            cache_publish_timeout_ms: Some(bridge_config::DEFAULT_CACHE_PUBLISH_TIMEOUT_MS),
            cache_flush_enabled: Some(true),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
            .unwrap_or(IpAddr::from([0, 0, 0, 0]))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Pool and cache settings; anything unset keeps the library default.
    pub fn bridge_config(&self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            pool_capacity: self.pool_capacity.unwrap_or(defaults.pool_capacity),
            slot_size_bytes: self.slot_size_bytes.unwrap_or(defaults.slot_size_bytes),
            max_lease_ms: self.max_lease_ms.unwrap_or(defaults.max_lease_ms),
            retry_wait_ms: self.retry_wait_ms.unwrap_or(defaults.retry_wait_ms),
            cache_max_entries: self.cache_max_entries.unwrap_or(defaults.cache_max_entries),
            cache_flush_interval_ms: self.cache_flush_interval_ms.unwrap_or(defaults.cache_flush_interval_ms),
            cache_publish_timeout_ms: self.cache_publish_timeout_ms.unwrap_or(defaults.cache_publish_timeout_ms),
            cache_flush_enabled: self.cache_flush_enabled.unwrap_or(defaults.cache_flush_enabled),
        }
    }
}

/// Outcome of reading the config file. The logger is not running yet when the
/// file is read, so this is kept and logged afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigFileStatus {
    Loaded(PathBuf),
    NotFound(PathBuf),
    /// The file exists but could not be read or parsed.
    Unusable { path: PathBuf, reason: String },
}

impl ConfigFileStatus {
    pub fn log(&self) {
        match self {
            ConfigFileStatus::Loaded(path) => log::info!("Config file loaded from {}.", path.display()),
            ConfigFileStatus::NotFound(path) => log::info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                path.display()
            ),
            ConfigFileStatus::Unusable { path, reason } => log::warn!(
                "Failed to load config file: {} ({}). Falling back to other sources.",
                path.display(),
                reason
            ),
        }
    }
}

/// Reads a JSON config file. Problems are reported and treated as "no file".
fn read_config_file(config_file_path: &Path) -> (Option<Config>, ConfigFileStatus) {
    let path = config_file_path.to_path_buf();
    if !config_file_path.exists() {
        return (None, ConfigFileStatus::NotFound(path));
    }

    match fs::read_to_string(config_file_path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => (Some(file_config), ConfigFileStatus::Loaded(path)),
            Err(e) => (None, ConfigFileStatus::Unusable { path, reason: e.to_string() }),
        },
        Err(e) => (None, ConfigFileStatus::Unusable { path, reason: e.to_string() }),
    }
}

/// Layers defaults, then the config file, then `cli` (which already holds
/// the environment variables).
pub fn resolve_config(cli: Config) -> (Config, ConfigFileStatus) {
    // 1. Load defaults
    let mut current_config = Config::defaults();

    // 2. Load from config file (server_databridge.conf) if present.
    //    The CLI may point at a different file.
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let (file_config, status) = read_config_file(&config_file_path);
    if let Some(file_config) = file_config {
        current_config = current_config.merge(file_config);
    }

    // 3. Override with environment variables and CLI arguments
    (current_config.merge(cli), status)
}

pub fn load_config() -> (Config, ConfigFileStatus) {
    resolve_config(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_file_or_cli() {
        let path = PathBuf::from("/nonexistent/server_databridge.conf");
        let (config, status) = resolve_config(Config {
            config_path: Some(path.clone()),
            ..Default::default()
        });
        assert_eq!(status, ConfigFileStatus::NotFound(path));

        assert_eq!(config.port(), 9003);
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.bind_address(), IpAddr::from([0, 0, 0, 0]));
        assert_eq!(config.bridge_config(), BridgeConfig::default());
    }

    #[test]
    fn test_cli_overrides_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9100, "poolCapacity": 64, "logLevel": "debug"}}"#).unwrap();

        let (config, status) = resolve_config(Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(9200),
            ..Default::default()
        });
        assert_eq!(status, ConfigFileStatus::Loaded(file.path().to_path_buf()));

        assert_eq!(config.port(), 9200);
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.bridge_config().pool_capacity, 64);
        assert_eq!(config.bridge_config().max_lease_ms, 2000);
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "port = 1").unwrap();

        let (config, status) = resolve_config(Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert_eq!(config.port(), DEFAULT_PORT);
        assert!(matches!(status, ConfigFileStatus::Unusable { .. }));
    }
}
