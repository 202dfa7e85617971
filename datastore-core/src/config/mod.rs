//! Configuration for catalog clients and the catalog service
//!
//! Settings come from a TOML file, environment variables, or both (the
//! environment wins). Every section falls back to defaults for keys it
//! does not mention.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::datastore::catalog::{
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_MAX_FRAME_SIZE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SEEN_REQUESTS, DEFAULT_TRANSACTION_IDLE_TIMEOUT,
};

/// Prefix of every environment variable read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "DATASTORE";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How clients reach the catalog
    pub catalog: CatalogConfig,

    /// How the catalog service runs
    pub service: ServiceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Client-side catalog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// host:port of the catalog service
    pub address: String,

    pub domain: String,

    pub environment: String,

    /// Shared token presented on every request
    #[serde(skip_serializing)]
    pub auth_token: Option<SecretString>,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Re-read attempts after a row version conflict
    pub max_conflict_retries: u32,

    pub max_frame_size: usize,
}

/// Catalog service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_address: SocketAddr,

    /// SQLite database file
    pub db_path: PathBuf,

    /// Pooled SQLite connections; each open transaction pins one
    pub pool_size: u32,

    /// Token every request must carry; unauthenticated when unset
    #[serde(skip_serializing)]
    pub auth_token: Option<SecretString>,

    /// Request ids remembered for replay rejection
    pub seen_requests_capacity: usize,

    pub max_frame_size: usize,

    /// Idle time after which an open transaction is rolled back
    #[serde(with = "humantime_serde")]
    pub transaction_idle_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7420".to_string(),
            domain: "default".to_string(),
            environment: "local".to_string(),
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 7420)),
            db_path: PathBuf::from("./data/catalog.db"),
            pool_size: 8,
            auth_token: None,
            seen_requests_capacity: DEFAULT_SEEN_REQUESTS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            transaction_idle_timeout: DEFAULT_TRANSACTION_IDLE_TIMEOUT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{}={:?}: {}", key, value, e)))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("{}={:?}: {}", key, value, e)))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: DATASTORE_<SECTION>_<KEY>
    /// Example: DATASTORE_CATALOG_ADDRESS=catalog.internal:7420
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// File (when given) overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileReadError(e.to_string()))?;
                toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `lookup`, keyed by full variable name
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |section: &str, key: &str| {
            let name = format!("{}_{}_{}", ENV_PREFIX, section, key);
            lookup(&name).map(|value| (name, value))
        };

        // Catalog client
        if let Some((_, value)) = var("CATALOG", "ADDRESS") {
            self.catalog.address = value;
        }
        if let Some((_, value)) = var("CATALOG", "DOMAIN") {
            self.catalog.domain = value;
        }
        if let Some((_, value)) = var("CATALOG", "ENVIRONMENT") {
            self.catalog.environment = value;
        }
        if let Some((_, value)) = var("CATALOG", "AUTH_TOKEN") {
            self.catalog.auth_token = Some(SecretString::new(value));
        }
        if let Some((name, value)) = var("CATALOG", "REQUEST_TIMEOUT") {
            self.catalog.request_timeout = parse_duration(&name, &value)?;
        }
        if let Some((name, value)) = var("CATALOG", "MAX_CONFLICT_RETRIES") {
            self.catalog.max_conflict_retries = parse(&name, &value)?;
        }

        // Catalog service
        if let Some((name, value)) = var("SERVICE", "BIND_ADDRESS") {
            self.service.bind_address = parse(&name, &value)?;
        }
        if let Some((_, value)) = var("SERVICE", "DB_PATH") {
            self.service.db_path = PathBuf::from(value);
        }
        if let Some((name, value)) = var("SERVICE", "POOL_SIZE") {
            self.service.pool_size = parse(&name, &value)?;
        }
        if let Some((_, value)) = var("SERVICE", "AUTH_TOKEN") {
            self.service.auth_token = Some(SecretString::new(value));
        }
        if let Some((name, value)) = var("SERVICE", "SEEN_REQUESTS_CAPACITY") {
            self.service.seen_requests_capacity = parse(&name, &value)?;
        }
        if let Some((name, value)) = var("SERVICE", "TRANSACTION_IDLE_TIMEOUT") {
            self.service.transaction_idle_timeout = parse_duration(&name, &value)?;
        }

        // Logging
        if let Some((_, value)) = var("LOG", "LEVEL") {
            self.logging.level = value;
        }
        if let Some((name, value)) = var("LOG", "JSON") {
            self.logging.json_format = parse(&name, &value)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate catalog config
        if self.catalog.domain.is_empty() || self.catalog.environment.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "catalog domain and environment must be set".to_string(),
            ));
        }
        if self.catalog.request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "request_timeout must be greater than 0".to_string(),
            ));
        }
        if self.catalog.max_frame_size == 0 || self.service.max_frame_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_frame_size must be greater than 0".to_string(),
            ));
        }

        // Validate service config; one connection serves requests outside
        // transactions, the rest can be pinned
        if self.service.pool_size < 2 {
            return Err(ConfigError::ValidationFailed(
                "pool_size must be at least 2".to_string(),
            ));
        }
        if self.service.seen_requests_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "seen_requests_capacity must be greater than 0".to_string(),
            ));
        }
        if self.service.transaction_idle_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "transaction_idle_timeout must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file; auth tokens are never written
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.service.pool_size = 1;
        assert!(config.validate().is_err());

        config = Config::default();
        config.catalog.environment.clear();
        assert!(config.validate().is_err());

        config = Config::default();
        config.catalog.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.service.transaction_idle_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("DATASTORE_CATALOG_DOMAIN", "ccip"),
                ("DATASTORE_CATALOG_ENVIRONMENT", "testnet"),
                ("DATASTORE_CATALOG_REQUEST_TIMEOUT", "2s 500ms"),
                ("DATASTORE_CATALOG_AUTH_TOKEN", "s3cret"),
                ("DATASTORE_SERVICE_POOL_SIZE", "16"),
                ("DATASTORE_SERVICE_TRANSACTION_IDLE_TIMEOUT", "90s"),
                ("DATASTORE_LOG_JSON", "true"),
            ]))
            .unwrap();

        assert_eq!(config.catalog.domain, "ccip");
        assert_eq!(config.catalog.environment, "testnet");
        assert_eq!(config.catalog.request_timeout, Duration::from_millis(2500));
        assert_eq!(
            config.catalog.auth_token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("s3cret")
        );
        assert_eq!(config.service.pool_size, 16);
        assert_eq!(config.service.transaction_idle_timeout, Duration::from_secs(90));
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_bad_env_value_names_variable() {
        let mut config = Config::default();
        let err = config
            .apply_env(lookup(&[("DATASTORE_SERVICE_POOL_SIZE", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("DATASTORE_SERVICE_POOL_SIZE"));
    }

    #[test]
    fn test_file_round_trip_drops_tokens() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("datastore.toml");

        let mut config = Config::default();
        config.catalog.domain = "ccip".to_string();
        config.service.auth_token = Some(SecretString::new("s3cret".to_string()));
        config.save_to_file(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("s3cret"));

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.catalog.domain, "ccip");
        assert!(loaded.service.auth_token.is_none());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [catalog]
            domain = "ccip"
            environment = "mainnet"
            request_timeout = "5s"
            "#,
        )
        .unwrap();
        assert_eq!(config.catalog.request_timeout, Duration::from_secs(5));
        assert_eq!(config.service.pool_size, ServiceConfig::default().pool_size);
        assert!(config.validate().is_ok());
    }
}
