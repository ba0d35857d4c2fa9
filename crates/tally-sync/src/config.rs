//! # Sync Configuration
//!
//! Configuration management for the device sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_SYNC_MODE=manual                                             │
//! │     TALLY_DEVICE_ID=till-1                                             │
//! │     TALLY_CENTRAL_URL=https://central.example.com                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     SyncMode::Auto, auto-generated device id                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Front Till"
//! account_id = "cafe-42"
//!
//! [central]
//! url = "https://central.example.com"
//! token = "<device jwt>"
//! request_timeout_secs = 30
//!
//! [sync]
//! mode = "auto"  # auto | manual | offline
//! batch_size = 100
//! poll_interval_secs = 5
//! max_attempts = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Mode
// =============================================================================

/// When the sync agent runs.
///
/// ```text
/// AUTO     timer (poll_interval_secs) + explicit triggers
/// MANUAL   explicit triggers only (sync_now)
/// OFFLINE  never; mutations keep queueing locally
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Auto,
    Manual,
    Offline,
}

impl SyncMode {
    /// Returns true if sync is enabled at all.
    pub fn is_sync_enabled(&self) -> bool {
        !matches!(self, SyncMode::Offline)
    }

    /// Returns true if the agent syncs on its own timer.
    pub fn is_periodic(&self) -> bool {
        matches!(self, SyncMode::Auto)
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Auto => write!(f, "auto"),
            SyncMode::Manual => write!(f, "manual"),
            SyncMode::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SyncMode::Auto),
            "manual" => Ok(SyncMode::Manual),
            "offline" | "disabled" => Ok(SyncMode::Offline),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown sync mode: '{}'. Valid options: auto, manual, offline",
                other
            ))),
        }
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// Identity of this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Front Till").
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Account (tenant) the device belongs to.
    #[serde(default = "default_account_id")]
    pub account_id: String,

    /// Device store location. Defaults to the platform data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

fn default_account_id() -> String {
    "default-account".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
            account_id: default_account_id(),
            database_path: None,
        }
    }
}

// =============================================================================
// Central Store Connection
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralSettings {
    /// Base URL of the central store, http:// or https://.
    #[serde(default = "default_central_url")]
    pub url: String,

    /// Bearer credential issued for this device.
    #[serde(default)]
    pub token: Option<String>,

    /// Deadline for each network call (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_central_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for CentralSettings {
    fn default() -> Self {
        CentralSettings {
            url: default_central_url(),
            token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Sync mode for this device.
    #[serde(default)]
    pub mode: SyncMode,

    /// Queue entries sent per push request.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Changes requested per pull page.
    #[serde(default = "default_pull_page_size")]
    pub pull_page_size: u32,

    /// Interval between sync cycles in auto mode (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Initial backoff after a transient failure (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff between retries (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Growth factor of the backoff interval.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Delivery attempts before a queue entry fails terminally.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Acknowledged queue entries older than this are purged (days).
    #[serde(default = "default_purge_after_days")]
    pub purge_after_days: u32,
}

fn default_batch_size() -> u32 {
    100
}
fn default_pull_page_size() -> u32 {
    500
}
fn default_poll_interval() -> u64 {
    5
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> u32 {
    10
}
fn default_purge_after_days() -> u32 {
    7
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            mode: SyncMode::default(),
            batch_size: default_batch_size(),
            pull_page_size: default_pull_page_size(),
            poll_interval_secs: default_poll_interval(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_max_attempts(),
            purge_after_days: default_purge_after_days(),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete device sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub central: CentralSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if self.device.account_id.trim().is_empty() {
            return Err(SyncError::MissingAccountId);
        }

        let url = Url::parse(&self.central.url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "Central URL must start with http:// or https://, got: {}",
                self.central.url
            )));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "batch_size must be greater than 0".into(),
            ));
        }

        if self.sync.pull_page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "pull_page_size must be greater than 0".into(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be greater than 0".into(),
            ));
        }

        if self.sync.initial_backoff() > self.sync.max_backoff() {
            return Err(SyncError::InvalidConfig(
                "initial_backoff_ms must not exceed max_backoff_secs".into(),
            ));
        }

        if self.sync.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(account) = std::env::var("TALLY_ACCOUNT_ID") {
            self.device.account_id = account;
        }

        if let Ok(path) = std::env::var("TALLY_DB_PATH") {
            self.device.database_path = Some(PathBuf::from(path));
        }

        if let Ok(mode) = std::env::var("TALLY_SYNC_MODE") {
            match mode.parse() {
                Ok(parsed) => {
                    debug!(mode = %mode, "Overriding sync mode from environment");
                    self.sync.mode = parsed;
                }
                Err(_) => warn!(mode = %mode, "Unknown sync mode in environment"),
            }
        }

        if let Ok(url) = std::env::var("TALLY_CENTRAL_URL") {
            debug!(url = %url, "Overriding central URL from environment");
            self.central.url = url;
        }

        if let Ok(token) = std::env::var("TALLY_CENTRAL_TOKEN") {
            self.central.token = Some(token);
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn account_id(&self) -> &str {
        &self.device.account_id
    }

    pub fn mode(&self) -> SyncMode {
        self.sync.mode
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.sync.mode.is_sync_enabled()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.central.request_timeout_secs)
    }

    /// Device store path: configured, or `tally.db` in the platform data dir.
    pub fn database_path(&self) -> SyncResult<PathBuf> {
        if let Some(path) = &self.device.database_path {
            return Ok(path.clone());
        }
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.data_dir().join("tally.db"))
            .ok_or_else(|| SyncError::InvalidConfig("No data directory available".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!("auto".parse::<SyncMode>().unwrap(), SyncMode::Auto);
        assert_eq!("MANUAL".parse::<SyncMode>().unwrap(), SyncMode::Manual);
        assert_eq!("disabled".parse::<SyncMode>().unwrap(), SyncMode::Offline);
        assert!("primary".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.sync.mode, SyncMode::Auto);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.max_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "till-1".to_string();
        config.central.url = "ws://central:8080".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.central.url = "not a url".to_string();
        assert!(config.validate().unwrap_err().is_config_error());

        config.central.url = "https://central.example.com".to_string();
        config.sync.initial_backoff_ms = 120_000;
        assert!(config.validate().is_err());

        config.sync.initial_backoff_ms = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_behavior() {
        assert!(SyncMode::Auto.is_periodic());
        assert!(!SyncMode::Manual.is_periodic());
        assert!(SyncMode::Manual.is_sync_enabled());
        assert!(!SyncMode::Offline.is_sync_enabled());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.id = "till-7".to_string();
        config.sync.mode = SyncMode::Manual;
        config.sync.batch_size = 25;
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[device]"));
        assert!(contents.contains("[central]"));

        let loaded: SyncConfig = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.device.id, "till-7");
        assert_eq!(loaded.sync.mode, SyncMode::Manual);
        assert_eq!(loaded.sync.batch_size, 25);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "till-2"
            "#,
        )
        .unwrap();
        assert_eq!(config.device.account_id, "default-account");
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.central.request_timeout_secs, 30);
    }
}
