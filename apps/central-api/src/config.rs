//! Central API configuration module.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Central API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentralConfig {
    /// HTTP listen address
    pub bind_addr: String,

    /// SQLite connection string
    pub database_url: String,

    /// JWT secret key for signing device credentials
    pub jwt_secret: String,

    /// Device credential lifetime in seconds
    pub jwt_lifetime_secs: i64,

    /// Largest push batch accepted; larger batches get HTTP 400
    pub max_batch_size: usize,

    /// Upper bound on the pull page size a device may request
    pub max_pull_limit: u32,

    /// Events after the latest snapshot that trigger automatic compaction
    pub compaction_threshold: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: "sqlite://tally-central.db?mode=rwc".to_string(),
            jwt_secret: "tally-central-dev-secret-change-in-production".to_string(),
            jwt_lifetime_secs: 30 * 24 * 3600,
            max_batch_size: 500,
            max_pull_limit: 1000,
            compaction_threshold: 200,
        }
    }
}

impl CentralConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = CentralConfig::default();

        let config = CentralConfig {
            bind_addr: env::var("TALLY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env::var("TALLY_DATABASE_URL").unwrap_or(defaults.database_url),
            jwt_secret: env::var("TALLY_JWT_SECRET").unwrap_or(defaults.jwt_secret),
            jwt_lifetime_secs: parse_var("TALLY_JWT_LIFETIME_SECS", defaults.jwt_lifetime_secs)?,
            max_batch_size: parse_var("TALLY_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            max_pull_limit: parse_var("TALLY_MAX_PULL_LIMIT", defaults.max_pull_limit)?,
            compaction_threshold: parse_var(
                "TALLY_COMPACTION_THRESHOLD",
                defaults.compaction_threshold,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingRequired("TALLY_JWT_SECRET".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue("TALLY_MAX_BATCH_SIZE".to_string()));
        }
        if self.max_pull_limit == 0 {
            return Err(ConfigError::InvalidValue("TALLY_MAX_PULL_LIMIT".to_string()));
        }
        if self.compaction_threshold == 0 {
            return Err(ConfigError::InvalidValue(
                "TALLY_COMPACTION_THRESHOLD".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CentralConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_batch_size, 500);
    }

    #[test]
    fn test_zero_batch_size_is_invalid() {
        let config = CentralConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(name)) if name == "TALLY_MAX_BATCH_SIZE"
        ));
    }
}
