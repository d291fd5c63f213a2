//! # duet - signaling for two-party audio/video calls
//!
//! Two peers negotiate a direct media session by exchanging small JSON
//! messages through a relay. The relay only routes by recipient identity;
//! everything else happens in the participant agents.
//!
//! - [`signal_core`]: identities, the message envelope and logging setup
//! - [`relay_core`]: the WebSocket relay server
//! - [`agent_core`]: the participant agent and its negotiation state machine
//!
//! ## Quick Start
//!
//! ```no_run
//! use duet::prelude::*;
//! use duet::agent_core::sim::{AutoAnswer, SimulatedMedia, SimulatedTransportFactory};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayServer::bind(RelayConfig::local()).await?.spawn();
//!
//! let alice = AgentBuilder::new()
//!     .with_relay_url(relay.url())
//!     .with_identity(Identity::new("alice")?)
//!     .with_media_source(Arc::new(SimulatedMedia::new()))
//!     .with_transport_factory(Arc::new(SimulatedTransportFactory::new()))
//!     .with_call_handler(Arc::new(AutoAnswer::accept()))
//!     .connect()
//!     .await?;
//!
//! alice.call(&Identity::new("bob")?).await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub use duet_agent_core as agent_core;
pub use duet_relay_core as relay_core;
pub use duet_signal_core as signal_core;

pub mod prelude {
    //! Common imports for duet applications

    pub use crate::agent_core::{
        AdmissionPolicy, AgentBuilder, AgentConfig, AgentError, AgentHandle, CallAction, CallEvent, CallHandler,
        CallState, EndReason, IncomingCall, MediaSource, PeerTransport, TransportFactory,
    };
    pub use crate::relay_core::{RelayConfig, RelayError, RelayServer, RelayServerHandle};
    pub use crate::signal_core::{setup_logging, Identity, LoggingConfig, MessageKind, Payload, SignalingMessage};
}

/// Version of the duet crates
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// One-line description of this crate
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
