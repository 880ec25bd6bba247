//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/collecte/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/collecte/` (~/.config/collecte/)
//! - Data: `$XDG_DATA_HOME/collecte/` (~/.local/share/collecte/)
//! - State/Logs: `$XDG_STATE_HOME/collecte/` (~/.local/state/collecte/)

use crate::error::{Error, Result};
use reqwest::Url;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that overrides `sync.csrf_token`
pub const CSRF_TOKEN_ENV: &str = "COLLECTE_CSRF_TOKEN";

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
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Local store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Outbox synchronization against the collector
    #[serde(default)]
    pub sync: SyncConfig,

    /// Request cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// How long a connection waits on a locked database before giving up
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_busy_timeout() -> u64 {
    5000
}

/// Collector synchronization configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote collector; relative action urls resolve against it
    #[serde(default = "default_collector_url")]
    pub collector_url: String,

    /// Path used for actions that carry no url of their own
    #[serde(default = "default_sync_path")]
    pub sync_path: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt when no response is obtained
    #[serde(default = "default_sync_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds; the n-th retry waits `n * backoff_ms`
    #[serde(default = "default_sync_backoff")]
    pub backoff_ms: u64,

    /// Flush on a fixed interval in addition to the other triggers
    #[serde(default)]
    pub periodic_interval_secs: Option<u64>,

    /// How often the connectivity probe checks the collector
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Anti-forgery token sent with same-origin sync requests
    #[serde(default)]
    pub csrf_token: Option<String>,

    /// Header carrying the anti-forgery token
    #[serde(default = "default_csrf_header")]
    pub csrf_header: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collector_url: default_collector_url(),
            sync_path: default_sync_path(),
            timeout_secs: default_sync_timeout(),
            max_retries: default_sync_max_retries(),
            backoff_ms: default_sync_backoff(),
            periodic_interval_secs: None,
            probe_interval_secs: default_probe_interval(),
            csrf_token: None,
            csrf_header: default_csrf_header(),
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Parsed collector base URL
    pub fn collector_base(&self) -> Result<Url> {
        Url::parse(&self.collector_url).map_err(|e| {
            Error::Config(format!(
                "sync.collector_url '{}' is not a valid URL: {}",
                self.collector_url, e
            ))
        })
    }

    /// Anti-forgery token, preferring the environment over the config file
    pub fn resolve_csrf_token(&self) -> Option<String> {
        std::env::var(CSRF_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.csrf_token.clone())
    }
}

fn default_collector_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_sync_path() -> String {
    "/api/sync-outbox/".to_string()
}

fn default_sync_timeout() -> u64 {
    15
}

fn default_sync_max_retries() -> u32 {
    1
}

fn default_sync_backoff() -> u64 {
    1000
}

fn default_probe_interval() -> u64 {
    10
}

fn default_csrf_header() -> String {
    "X-CSRFToken".to_string()
}

/// Request cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Origin the cache serves; defaults to the collector URL
    #[serde(default)]
    pub origin: Option<String>,

    /// Name of the precache generation
    #[serde(default = "default_shell_generation")]
    pub shell_generation: String,

    /// Name of the bounded runtime generation
    #[serde(default = "default_runtime_generation")]
    pub runtime_generation: String,

    /// Upper bound on runtime entries
    #[serde(default = "default_max_runtime_entries")]
    pub max_runtime_entries: usize,

    /// Navigation requests fall back to the shell after this long
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout_ms: u64,

    /// Paths starting with or containing this prefix are API requests
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Offline fallback page (must be part of the precache manifest to be useful)
    #[serde(default = "default_offline_page")]
    pub offline_page: String,

    /// Entry points fetched into the shell generation at install time
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,

    /// Activate right after install instead of waiting for SKIP_WAITING
    #[serde(default = "default_skip_waiting")]
    pub skip_waiting: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            origin: None,
            shell_generation: default_shell_generation(),
            runtime_generation: default_runtime_generation(),
            max_runtime_entries: default_max_runtime_entries(),
            navigation_timeout_ms: default_navigation_timeout(),
            api_prefix: default_api_prefix(),
            offline_page: default_offline_page(),
            precache: default_precache(),
            skip_waiting: default_skip_waiting(),
        }
    }
}

impl CacheConfig {
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }
}

fn default_shell_generation() -> String {
    "collecte-shell-v3".to_string()
}

fn default_runtime_generation() -> String {
    "collecte-runtime-v1".to_string()
}

fn default_max_runtime_entries() -> usize {
    100
}

fn default_navigation_timeout() -> u64 {
    3000
}

fn default_api_prefix() -> String {
    "/api/".to_string()
}

fn default_offline_page() -> String {
    "/static/offline.html".to_string()
}

fn default_precache() -> Vec<String> {
    vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/static/offline.html".to_string(),
        "/static/icons/icon-192.png".to_string(),
        "/static/icons/icon-512.png".to_string(),
    ]
}

fn default_skip_waiting() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
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
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        self.sync.collector_base()?;
        if let Some(origin) = &self.cache.origin {
            Url::parse(origin).map_err(|e| {
                Error::Config(format!("cache.origin '{}' is not a valid URL: {}", origin, e))
            })?;
        }
        if self.sync.timeout_secs == 0 {
            return Err(Error::Config(
                "sync.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.cache.max_runtime_entries == 0 {
            return Err(Error::Config(
                "cache.max_runtime_entries must be greater than 0".to_string(),
            ));
        }
        if self.cache.shell_generation == self.cache.runtime_generation {
            return Err(Error::Config(
                "cache.shell_generation and cache.runtime_generation must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Origin served by the request cache
    pub fn cache_origin(&self) -> Result<Url> {
        match &self.cache.origin {
            Some(origin) => Url::parse(origin)
                .map_err(|e| Error::Config(format!("invalid cache.origin: {}", e))),
            None => self.sync.collector_base(),
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/collecte/config.toml` (~/.config/collecte/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("collecte").join("config.toml")
    }

    /// Returns the data directory path (for SQLite databases)
    ///
    /// `$XDG_DATA_HOME/collecte/` (~/.local/share/collecte/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("collecte")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/collecte/` (~/.local/state/collecte/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("collecte")
    }

    /// Returns the application store path (entities and outbox)
    ///
    /// `$XDG_DATA_HOME/collecte/collecte.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("collecte.db")
    }

    /// Returns the request cache path
    ///
    /// `$XDG_DATA_HOME/collecte/cache.db`
    pub fn cache_path() -> PathBuf {
        Self::data_dir().join("cache.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.sync_path, "/api/sync-outbox/");
        assert_eq!(config.sync.max_retries, 1);
        assert_eq!(config.sync.timeout(), Duration::from_secs(15));
        assert_eq!(config.cache.max_runtime_entries, 100);
        assert_eq!(config.cache.precache.len(), 5);
        assert!(config.cache.skip_waiting);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sync]
collector_url = "https://collecte.example.org"
max_retries = 3
backoff_ms = 250
periodic_interval_secs = 60

[cache]
max_runtime_entries = 20
api_prefix = "/v2/api/"
precache = ["/", "/static/offline.html"]

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.backoff(), Duration::from_millis(250));
        assert_eq!(
            config.sync.periodic_interval(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.cache.max_runtime_entries, 20);
        assert_eq!(config.cache.precache, vec!["/", "/static/offline.html"]);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.cache_origin().unwrap().as_str(),
            "https://collecte.example.org/"
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.cache.max_runtime_entries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.collector_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.runtime_generation = config.cache.shell_generation.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_periodic_interval_disables_timer() {
        let config = SyncConfig {
            periodic_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(config.periodic_interval().is_none());
    }
}
