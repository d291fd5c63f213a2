//! # duet-agent-core
//!
//! One participant of a two-party audio/video call. The agent keeps a
//! persistent connection to the duet relay, and for every remote peer it
//! runs a negotiation session that exchanges keys, session descriptions and
//! network candidates until the media transport reports a connection.
//!
//! ```text
//! Idle ─▶ KeyExchanged ─▶ OfferSent | OfferReceived ─▶ AnswerExchanged ─▶ Connected ─▶ Ended
//! ```
//!
//! Media capture, the transport and the user interface are supplied by the
//! embedder through the traits in [`collaborators`]; [`sim`] has in-process
//! versions of each.
//!
//! ## Modules
//!
//! - [`agent`]: [`AgentBuilder`], [`AgentHandle`] and the message dispatcher
//! - [`session`]: the per-peer [`NegotiationSession`] record
//! - [`signaling`]: the relay connection ([`RelayClient`], [`RelayLink`])
//! - [`config`]: [`AgentConfig`] and [`AdmissionPolicy`]

pub mod agent;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod session;
mod session_task;
pub mod signaling;
pub mod sim;
pub mod types;

pub use agent::{AgentBuilder, AgentHandle};
pub use collaborators::{
    CallHandler, Connectivity, KeyGenerator, KeyPair, MediaSource, MediaTrack, PeerTransport, TrackKind,
    TransportEvent, TransportFactory,
};
pub use config::{AdmissionPolicy, AgentConfig};
pub use error::{AgentError, Result};
pub use session::NegotiationSession;
pub use signaling::{RelayClient, RelayEvent, RelayLink, RelayLinkPeer};
pub use types::{CallAction, CallEvent, CallState, EndReason, IncomingCall, Role, SessionSnapshot};
