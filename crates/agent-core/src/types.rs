//! Call state, events and snapshots exposed by the agent

use chrono::{DateTime, Utc};
use duet_signal_core::{Identity, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Negotiation state of one session
///
/// `Idle -> KeyExchanged -> OfferSent | OfferReceived -> AnswerExchanged -> Connected -> Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    /// The remote key arrived before any offer
    KeyExchanged,
    /// Our offer is out, waiting for the answer
    OfferSent,
    /// An offer arrived and is being answered
    OfferReceived,
    /// Both descriptions are set, waiting for connectivity
    AnswerExchanged,
    Connected,
    Ended,
}

impl CallState {
    /// Past key exchange and engaged in a call
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::OfferSent
                | CallState::OfferReceived
                | CallState::AnswerExchanged
                | CallState::Connected
        )
    }

    /// Still working towards a connection
    pub fn is_negotiating(&self) -> bool {
        matches!(
            self,
            CallState::Idle
                | CallState::KeyExchanged
                | CallState::OfferSent
                | CallState::OfferReceived
                | CallState::AnswerExchanged
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "Idle",
            CallState::KeyExchanged => "KeyExchanged",
            CallState::OfferSent => "OfferSent",
            CallState::OfferReceived => "OfferReceived",
            CallState::AnswerExchanged => "AnswerExchanged",
            CallState::Connected => "Connected",
            CallState::Ended => "Ended",
        };
        f.write_str(name)
    }
}

/// Which side of the offer/answer exchange we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Decision of the call handler for an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    /// Answer the offer
    Accept,
    /// Decline; the caller receives a `reject`
    Reject,
    /// Drop the offer without telling the caller
    Ignore,
}

/// Information handed to the call handler for an incoming offer
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub remote: Identity,
    /// The caller's key, if it arrived before the offer
    pub remote_public_key: Option<PublicKey>,
    pub received_at: DateTime<Utc>,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// The remote declined our offer
    Rejected { reason: Option<String> },
    /// We declined the remote's offer (handler reject, prompt timeout, busy)
    Declined,
    /// The handler chose to ignore the offer
    Ignored,
    NegotiationFailed(String),
    /// The transport failed after connecting
    TransportFailed(String),
    TransportClosed,
    /// The relay connection dropped while negotiating
    RelayLost,
    /// Key-only session that no call or offer followed in time
    Expired,
    Shutdown,
}

impl EndReason {
    /// Reasons that are reported as a failed negotiation
    pub fn failure_message(&self) -> Option<String> {
        match self {
            EndReason::NegotiationFailed(message) => Some(message.clone()),
            EndReason::Rejected { reason } => Some(match reason {
                Some(reason) => format!("rejected by remote: {}", reason),
                None => "rejected by remote".to_string(),
            }),
            _ => None,
        }
    }

    /// Whether the remote should be told with a `hangup`
    pub fn notifies_remote(&self) -> bool {
        matches!(self, EndReason::LocalHangup | EndReason::Shutdown)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "local hangup"),
            EndReason::RemoteHangup => write!(f, "remote hangup"),
            EndReason::Rejected { reason: Some(r) } => write!(f, "rejected ({})", r),
            EndReason::Rejected { reason: None } => write!(f, "rejected"),
            EndReason::Declined => write!(f, "declined"),
            EndReason::Ignored => write!(f, "ignored"),
            EndReason::NegotiationFailed(r) => write!(f, "negotiation failed: {}", r),
            EndReason::TransportFailed(r) => write!(f, "transport failed: {}", r),
            EndReason::TransportClosed => write!(f, "transport closed"),
            EndReason::RelayLost => write!(f, "relay lost"),
            EndReason::Expired => write!(f, "expired"),
            EndReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Events broadcast to [`AgentHandle::subscribe`](crate::AgentHandle::subscribe) listeners
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        remote: Identity,
        from: CallState,
        to: CallState,
    },
    IncomingCall {
        remote: Identity,
    },
    RemoteKey {
        remote: Identity,
        key: PublicKey,
    },
    NegotiationFailed {
        remote: Identity,
        reason: String,
    },
    Ended {
        remote: Identity,
        reason: EndReason,
    },
    RelayDisconnected,
}

impl CallEvent {
    pub fn remote(&self) -> Option<&Identity> {
        match self {
            CallEvent::StateChanged { remote, .. }
            | CallEvent::IncomingCall { remote }
            | CallEvent::RemoteKey { remote, .. }
            | CallEvent::NegotiationFailed { remote, .. }
            | CallEvent::Ended { remote, .. } => Some(remote),
            CallEvent::RelayDisconnected => None,
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub remote: Identity,
    pub role: Option<Role>,
    pub state: CallState,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    pub local_public_key: Option<PublicKey>,
    pub remote_public_key: Option<PublicKey>,
    /// Every candidate received from the remote
    pub remote_candidates: usize,
    /// Remote candidates waiting for the remote description
    pub buffered_remote_candidates: usize,
    /// Local candidates waiting for the local description to go out
    pub queued_local_candidates: usize,
    pub created_at: DateTime<Utc>,
}
