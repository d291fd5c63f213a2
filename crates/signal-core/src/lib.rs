//! # duet-signal-core
//!
//! Wire model shared by the duet relay and participant agents: participant
//! [`Identity`], the JSON [`SignalingMessage`] exchanged through the relay,
//! and the [`RoutingHeader`] that is the only part the relay reads.
//!
//! ```
//! use duet_signal_core::{Identity, SignalingMessage, PublicKey};
//!
//! let alice = Identity::new("alice").unwrap();
//! let bob = Identity::new("bob").unwrap();
//! let frame = SignalingMessage::key(&alice, &bob, PublicKey::new(vec![7, 8])).encode().unwrap();
//! assert!(frame.contains("\"recipientId\":\"bob\""));
//! ```

pub mod error;
pub mod identity;
pub mod logging;
pub mod message;

pub use error::{Result, SignalError};
pub use identity::Identity;
pub use logging::{log_welcome, parse_log_level, setup_logging, LoggingConfig};
pub use message::{
    Candidate, MessageKind, Payload, PublicKey, RoutingHeader, SessionDescription, SignalingMessage,
};

/// Default upper bound for a single signaling frame
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
