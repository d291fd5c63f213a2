//! Error types for the participant agent

use duet_signal_core::SignalError;
use thiserror::Error;

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors surfaced by the agent API and its collaborators
#[derive(Debug, Error)]
pub enum AgentError {
    /// The relay connection is gone; no new calls can be placed
    #[error("Relay unavailable")]
    RelayUnavailable,

    /// Connecting to the relay failed
    #[error("Failed to connect to relay {url}: {message}")]
    RelayConnect { url: String, message: String },

    /// A call with this peer is already in progress
    #[error("Already in a call with {remote}")]
    AlreadyInCall { remote: String },

    /// The admission policy does not allow another call
    #[error("Busy: {active} active call(s)")]
    Busy { active: usize },

    /// The requested peer cannot be called
    #[error("Invalid remote: {reason}")]
    InvalidRemote { reason: String },

    /// Session description or state machine violation
    #[error("Negotiation error: {message}")]
    Negotiation { message: String },

    /// The media transport reported an error
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Media capture failed
    #[error("Media error: {message}")]
    Media { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Signal(#[from] SignalError),

    /// Waiting for a condition timed out
    #[error("Timed out: {message}")]
    Timeout { message: String },

    /// The agent has shut down
    #[error("Agent stopped")]
    Stopped,
}

impl AgentError {
    pub fn relay_connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RelayConnect {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn invalid_remote(reason: impl Into<String>) -> Self {
        Self::InvalidRemote {
            reason: reason.into(),
        }
    }

    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn media(message: impl Into<String>) -> Self {
        Self::Media {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }
}
