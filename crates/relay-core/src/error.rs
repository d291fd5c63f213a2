//! Error types for the relay

use duet_signal_core::SignalError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Binding or serving the listener failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values are out of range
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Signal(#[from] SignalError),

    /// The server task ended abnormally
    #[error("Relay server task failed: {message}")]
    Server { message: String },
}

impl RelayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }
}
