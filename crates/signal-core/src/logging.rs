//! Logging bootstrap for the `duet` binary
//!
//! `RUST_LOG` directives still apply; the configured level is added on top.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Result, SignalError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    /// JSON lines on stdout instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig { level, json: false }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let builder = fmt::Subscriber::builder().with_env_filter(filter);

    let result = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| SignalError::logging(e.to_string()))
}

/// Parse a log level such as `info` or `DEBUG`
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| SignalError::logging(format!("Invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{}", app_name, version);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("chatty").is_err());
    }

    #[test]
    fn test_config() {
        assert_eq!(LoggingConfig::default(), LoggingConfig::new(Level::INFO));
        let config = LoggingConfig::new(Level::TRACE).with_json();
        assert!(config.json);
        assert_eq!(config.level, Level::TRACE);
    }

    #[test]
    fn test_second_install_is_an_error() {
        let config = LoggingConfig::new(Level::WARN);
        let _ = setup_logging(&config);
        let err = setup_logging(&config).unwrap_err();
        assert!(matches!(err, SignalError::Logging { .. }));
    }
}
