//! Identity to connection registry
//!
//! The registry is the only state shared between connection tasks. It is a
//! sharded [`DashMap`], so reads and writes from different connections never
//! contend on a single lock, and no entry guard is ever held across an
//! `.await`: lookups clone the [`ConnectionHandle`] out of the map.

use dashmap::DashMap;
use duet_signal_core::Identity;
use std::fmt;
use tokio::sync::mpsc;

/// Relay-local id of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Cloneable handle to a connection's outbound queue
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self { id, tx }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    bindings: DashMap<Identity, ConnectionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to a connection, replacing any previous binding
    ///
    /// Returns the id of the connection that previously held the identity.
    pub fn bind(&self, identity: Identity, handle: ConnectionHandle) -> Option<ConnectionId> {
        self.bindings.insert(identity, handle).map(|old| old.id)
    }

    pub fn lookup(&self, identity: &Identity) -> Option<ConnectionHandle> {
        self.bindings.get(identity).map(|entry| entry.value().clone())
    }

    /// Connection currently holding `identity`
    pub fn bound_to(&self, identity: &Identity) -> Option<ConnectionId> {
        self.bindings.get(identity).map(|entry| entry.id)
    }

    /// Remove `identity` only if it still points at `conn`
    pub fn release(&self, identity: &Identity, conn: ConnectionId) -> bool {
        self.bindings
            .remove_if(identity, |_, handle| handle.id == conn)
            .is_some()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.bindings.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
