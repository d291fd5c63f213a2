//! Relay configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{RelayError, Result};

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_message_bytes() -> usize {
    duet_signal_core::DEFAULT_MAX_MESSAGE_BYTES
}

/// Relay settings, loadable from TOML
///
/// ```toml
/// bind_address = "127.0.0.1:9000"
/// channel_capacity = 64
/// ```
///
/// Missing keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Outbound queue depth per connection; frames beyond it are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Frames larger than this are dropped unread
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            channel_capacity: default_channel_capacity(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl RelayConfig {
    /// Defaults suitable for tests: loopback on an ephemeral port
    pub fn local() -> Self {
        Self::default().with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(RelayError::config("channel_capacity must be greater than zero"));
        }
        if self.max_message_bytes == 0 {
            return Err(RelayError::config("max_message_bytes must be greater than zero"));
        }
        Ok(())
    }
}
