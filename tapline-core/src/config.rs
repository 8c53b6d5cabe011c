//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tapline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tapline/` (~/.config/tapline/)
//! - Data: `$XDG_DATA_HOME/tapline/` (~/.local/share/tapline/)
//! - State/Logs: `$XDG_STATE_HOME/tapline/` (~/.local/state/tapline/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Flush policy
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Collector endpoint configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Event store location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Flush trigger thresholds
#[derive(Debug, Deserialize, Clone)]
pub struct BatchingConfig {
    /// Records per batch before an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Seconds after the first record of a batch before a timed flush
    #[serde(default = "default_max_batch_time")]
    pub max_batch_time_secs: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_time_secs: default_max_batch_time(),
        }
    }
}

impl BatchingConfig {
    /// Timer length as a `Duration`
    pub fn max_batch_time(&self) -> Duration {
        Duration::from_secs(self.max_batch_time_secs)
    }

    /// Reject thresholds that would make the coordinator unusable
    pub fn validate(&self) -> Result<()> {
        validate_batching(self.max_batch_size, self.max_batch_time())
    }
}

/// Shared by config files and the coordinator builder
pub(crate) fn validate_batching(max_batch_size: usize, max_batch_time: Duration) -> Result<()> {
    if max_batch_size == 0 {
        return Err(Error::Config(
            "batching.max_batch_size must be greater than 0".to_string(),
        ));
    }
    if max_batch_time.is_zero() {
        return Err(Error::Config(
            "batching.max_batch_time_secs must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_batch_time() -> u64 {
    10
}

/// Collector endpoint configuration
///
/// When disabled, records still accumulate in the local store.
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Enable/disable network delivery
    #[serde(default)]
    pub enabled: bool,

    /// Collector base URL (e.g., `https://collector.example.com`)
    pub endpoint: Option<String>,

    /// API key sent as a bearer token
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,

    /// Max in-client retry attempts for transient failures
    #[serde(default = "default_delivery_max_retries")]
    pub max_retries: usize,

    /// Seconds between reachability probes
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            timeout_secs: default_delivery_timeout(),
            max_retries: default_delivery_max_retries(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl DeliveryConfig {
    /// Check if delivery is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.endpoint.is_some() && self.api_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.endpoint.is_none() {
            return Err(Error::Config(
                "delivery.endpoint is required when delivery is enabled".to_string(),
            ));
        }
        if self.api_key.is_none() {
            return Err(Error::Config(
                "delivery.api_key is required when delivery is enabled".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "delivery.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

fn default_delivery_timeout() -> u64 {
    30
}

fn default_delivery_max_retries() -> usize {
    3
}

fn default_health_interval() -> u64 {
    15
}

/// Event store location
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Override for the SQLite file (default: `$XDG_DATA_HOME/tapline/events.db`)
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved store path
    pub fn database_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(Config::database_path)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.batching.validate()?;
        config.delivery.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tapline/config.toml` (~/.config/tapline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tapline").join("config.toml")
    }

    /// Returns the data directory path (for the event store)
    ///
    /// `$XDG_DATA_HOME/tapline/` (~/.local/share/tapline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tapline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tapline/` (~/.local/state/tapline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tapline")
    }

    /// Returns the default event store path
    ///
    /// `$XDG_DATA_HOME/tapline/events.db` (~/.local/share/tapline/events.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("events.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/tapline/tapline.log` (~/.local/state/tapline/tapline.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("tapline.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
