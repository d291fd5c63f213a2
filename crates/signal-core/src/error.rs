//! Error types for the signaling wire model

use thiserror::Error;

/// Result type for signaling operations
pub type Result<T> = std::result::Result<T, SignalError>;

/// Errors produced while encoding, decoding or validating signaling messages
#[derive(Debug, Error)]
pub enum SignalError {
    /// The frame is not valid JSON or does not match the message shape
    #[error("Malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame exceeds the configured size limit
    #[error("Signaling message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    /// An identity was empty or otherwise unusable
    #[error("Invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    /// Logging could not be initialised
    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

impl SignalError {
    /// Create an invalid identity error
    pub fn invalid_identity(reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            reason: reason.into(),
        }
    }

    /// Create a logging setup error
    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }
}
