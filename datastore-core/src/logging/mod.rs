//! Logging setup
//!
//! Everything in this crate logs through `tracing`. Binaries call
//! [`init_logging_with_config`] once at startup; `RUST_LOG` overrides the
//! configured level when set.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_timestamp: bool,
    pub with_target: bool,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }

    /// Build from the `[logging]` section of the application config
    pub fn from_settings(settings: &LoggingConfig) -> Result<Self, LoggingError> {
        Ok(Self {
            level: settings.level.parse()?,
            with_timestamp: settings.with_timestamp,
            with_target: settings.with_target,
            json_format: settings.json_format,
        })
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer().with_target(self.with_target);
        match (self.json_format, self.with_timestamp) {
            (true, true) => layer.json().boxed(),
            (true, false) => layer.json().without_time().boxed(),
            (false, true) => layer.boxed(),
            (false, false) => layer.without_time().boxed(),
        }
    }
}

/// Initialize logging with default configuration
pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber; fails if one is already installed
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::InitializationFailed(e.to_string()))
}
