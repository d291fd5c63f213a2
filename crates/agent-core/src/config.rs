//! Agent configuration

use duet_signal_core::Identity;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AgentError, Result};

fn default_relay_url() -> String {
    "ws://localhost:8080".to_string()
}

fn default_accept_timeout_ms() -> u64 {
    30_000
}

fn default_pending_session_ttl_ms() -> u64 {
    30_000
}

fn default_max_pending_sessions() -> usize {
    64
}

fn default_channel_capacity() -> usize {
    256
}

/// What to do with an offer from a new peer while another call is active
///
/// ```toml
/// [admission]
/// mode = "allow_concurrent"
/// max_sessions = 2
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Answer every competing offer with `reject{reason:"busy"}`
    #[default]
    RejectWhenBusy,
    /// Run up to `max_sessions` calls at once
    AllowConcurrent { max_sessions: usize },
}

impl AdmissionPolicy {
    /// Whether one more call may start while `active` calls are running
    pub fn admits(&self, active: usize) -> bool {
        match self {
            AdmissionPolicy::RejectWhenBusy => active == 0,
            AdmissionPolicy::AllowConcurrent { max_sessions } => active < *max_sessions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket URL of the relay
    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    /// Local identity; generated at startup when absent
    #[serde(default)]
    pub identity: Option<Identity>,

    /// How long the call handler may take to accept an incoming call, in milliseconds
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// How long a session that only holds a remote key waits for a call or offer
    #[serde(default = "default_pending_session_ttl_ms")]
    pub pending_session_ttl_ms: u64,

    /// Key-only sessions kept at once; keys from further strangers are dropped
    #[serde(default = "default_max_pending_sessions")]
    pub max_pending_sessions: usize,

    #[serde(default)]
    pub admission: AdmissionPolicy,

    /// Depth of the relay and per-session queues
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            identity: None,
            accept_timeout_ms: default_accept_timeout_ms(),
            pending_session_ttl_ms: default_pending_session_ttl_ms(),
            max_pending_sessions: default_max_pending_sessions(),
            admission: AdmissionPolicy::default(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl AgentConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_pending_session_ttl(mut self, ttl: Duration) -> Self {
        self.pending_session_ttl_ms = duration_ms(ttl);
        self
    }

    pub fn with_max_pending_sessions(mut self, max: usize) -> Self {
        self.max_pending_sessions = max;
        self
    }

    pub fn with_admission(mut self, policy: AdmissionPolicy) -> Self {
        self.admission = policy;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn pending_session_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_session_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(AgentError::config(format!(
                "relay_url must be a ws:// or wss:// URL, got {}",
                self.relay_url
            )));
        }
        if let Some(identity) = &self.identity {
            if identity.as_str().trim().is_empty() {
                return Err(AgentError::config("identity must not be empty"));
            }
        }
        if self.accept_timeout_ms == 0 {
            return Err(AgentError::config("accept_timeout_ms must be greater than zero"));
        }
        if self.pending_session_ttl_ms == 0 {
            return Err(AgentError::config("pending_session_ttl_ms must be greater than zero"));
        }
        if self.max_pending_sessions == 0 {
            return Err(AgentError::config("max_pending_sessions must be greater than zero"));
        }
        if self.channel_capacity == 0 {
            return Err(AgentError::config("channel_capacity must be greater than zero"));
        }
        if let AdmissionPolicy::AllowConcurrent { max_sessions: 0 } = self.admission {
            return Err(AgentError::config("max_sessions must be greater than zero"));
        }
        Ok(())
    }
}

/// Whole milliseconds, never rounding a non-zero duration down to zero
fn duration_ms(duration: Duration) -> u64 {
    let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 && !duration.is_zero() {
        1
    } else {
        ms
    }
}
