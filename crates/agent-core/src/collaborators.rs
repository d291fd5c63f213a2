//! Interfaces to the things the agent drives but does not implement
//!
//! Media capture, the peer-to-peer media transport, the user interface and
//! key generation all live outside the negotiation core. The agent only
//! talks to them through these traits; [`crate::sim`] provides in-process
//! implementations for demos and tests.
//!
//! # Transport lifecycle
//!
//! A [`TransportFactory`] creates one [`PeerTransport`] per session together
//! with the receiving end of its [`TransportEvent`] channel. The session
//! task drains that channel alongside signaling input, so transport
//! callbacks are serialized with everything else the session does.

use async_trait::async_trait;
use duet_signal_core::{Candidate, Identity, PublicKey, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{CallAction, CallState, IncomingCall, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured or received media track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Local media capture
///
/// The agent calls `acquire` once per session that places or accepts a call
/// and `stop_all` exactly once when that session ends. Sources shared by
/// concurrent sessions are expected to count these calls.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Vec<MediaTrack>>;

    async fn stop_all(&self);
}

/// Connectivity of a peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks from a [`PeerTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local network path was discovered and should reach the remote
    LocalCandidate(Candidate),
    ConnectivityChanged(Connectivity),
    /// The remote's media arrived
    RemoteTracks(Vec<MediaTrack>),
    /// Unrecoverable transport error
    Failed(String),
}

/// One peer-to-peer media transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Produce the local offer (initiator) or answer (responder)
    async fn create_description(&self, role: Role) -> Result<SessionDescription>;

    async fn apply_remote_description(&self, description: &SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<()>;

    async fn attach_tracks(&self, tracks: &[MediaTrack]) -> Result<()>;

    async fn close(&self);
}

/// Creates a transport and its event channel for a session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        remote: &Identity,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>)>;
}

/// Opaque local key pair
///
/// Only the public half ever leaves the agent.
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    secret: Vec<u8>,
}

impl KeyPair {
    pub fn new(public: PublicKey, secret: Vec<u8>) -> Self {
        Self { public, secret }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> KeyPair;
}

/// User interface hooks
///
/// Only `on_incoming_call` is required; the notifications default to no-ops.
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Decide on an incoming call. Bounded by the agent's accept timeout.
    async fn on_incoming_call(&self, call: IncomingCall) -> CallAction;

    async fn on_call_state_changed(&self, _remote: &Identity, _from: CallState, _to: CallState) {}

    async fn on_local_media(&self, _remote: &Identity, _tracks: &[MediaTrack]) {}

    async fn on_remote_media(&self, _remote: &Identity, _tracks: &[MediaTrack]) {}

    async fn on_negotiation_failed(&self, _remote: &Identity, _reason: &str) {}
}
