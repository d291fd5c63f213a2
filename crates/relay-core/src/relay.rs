//! Connection-agnostic routing core
//!
//! [`Relay`] knows nothing about sockets. The WebSocket server (or a test)
//! calls [`Relay::on_connect`] for every accepted connection, feeds each
//! inbound text frame to [`Relay::on_message`] and finally calls
//! [`Relay::on_disconnect`]. Outbound frames for a connection are delivered
//! through the bounded queue returned by `on_connect`.
//!
//! Routing only ever reads the [`RoutingHeader`]; the original text is
//! forwarded byte-for-byte, so message kinds the relay has never heard of
//! pass through unchanged.

use duet_signal_core::{Identity, RoutingHeader, SignalError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::{ConnectionHandle, ConnectionId, Registry};

/// Per-connection state owned by the connection's task
#[derive(Debug)]
pub struct ConnectionContext {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    identity: Option<Identity>,
}

impl ConnectionContext {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identity most recently declared on this connection
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued on the recipient's connection
    Forwarded { to: ConnectionId },
    /// No `recipientId`; the frame only (re)registered its sender
    NoRecipient,
    /// Nobody is registered under the recipient identity
    UnknownRecipient,
    /// The recipient's connection closed before the frame could be queued
    RecipientGone,
    /// Addressed to the sending connection itself
    SelfAddressed,
    /// Not JSON, not an object, or no string `type`
    Malformed,
    /// Larger than `max_message_bytes`
    TooLarge,
    /// The recipient's outbound queue is full
    QueueFull,
}

impl Dispatch {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Dispatch::Forwarded { .. })
    }
}

#[derive(Debug, Default)]
struct RelayCounters {
    connections_open: AtomicUsize,
    forwarded: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unroutable: AtomicU64,
    dropped_overflow: AtomicU64,
}

/// Point-in-time relay counters, served on `/stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub connections_open: usize,
    pub registered: usize,
    pub forwarded: u64,
    pub dropped_malformed: u64,
    pub dropped_unroutable: u64,
    pub dropped_overflow: u64,
}

pub struct Relay {
    config: RelayConfig,
    registry: Arc<Registry>,
    counters: RelayCounters,
    next_connection: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self::with_registry(config, Arc::new(Registry::new()))
    }

    /// Build a relay around an existing registry
    pub fn with_registry(config: RelayConfig, registry: Arc<Registry>) -> Self {
        Self {
            config,
            registry,
            counters: RelayCounters::default(),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Accept a new, unregistered connection
    pub fn on_connect(&self) -> (ConnectionContext, mpsc::Receiver<String>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        self.counters.connections_open.fetch_add(1, Ordering::Relaxed);
        debug!("Accepted connection {}", id);

        (
            ConnectionContext {
                id,
                tx,
                identity: None,
            },
            rx,
        )
    }

    /// Route one inbound text frame
    pub fn on_message(&self, ctx: &mut ConnectionContext, raw: &str) -> Dispatch {
        let header = match RoutingHeader::parse(raw, self.config.max_message_bytes) {
            Ok(header) => header,
            Err(SignalError::TooLarge { size, limit }) => {
                debug!("Dropping {} byte frame from {} (limit {})", size, ctx.id, limit);
                self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                return Dispatch::TooLarge;
            }
            Err(e) => {
                debug!("Dropping malformed frame from {}: {}", ctx.id, e);
                self.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                return Dispatch::Malformed;
            }
        };

        if let Some(sender) = header.sender_id {
            self.register(ctx, sender);
        }

        let Some(recipient) = header.recipient_id else {
            debug!("{} frame from {} has no recipient", header.kind, ctx.id);
            return Dispatch::NoRecipient;
        };

        let Some(target) = self.registry.lookup(&recipient) else {
            debug!("Dropping {} frame for unknown recipient {}", header.kind, recipient.short());
            self.counters.dropped_unroutable.fetch_add(1, Ordering::Relaxed);
            return Dispatch::UnknownRecipient;
        };

        if target.id == ctx.id {
            debug!("Not echoing {} frame back to {}", header.kind, ctx.id);
            self.counters.dropped_unroutable.fetch_add(1, Ordering::Relaxed);
            return Dispatch::SelfAddressed;
        }

        match target.tx.try_send(raw.to_owned()) {
            Ok(()) => {
                debug!(
                    "Forwarded {} frame {} -> {} ({})",
                    header.kind,
                    ctx.id,
                    target.id,
                    recipient.short()
                );
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                Dispatch::Forwarded { to: target.id }
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue of {} full, dropping {} frame for {}",
                    target.id,
                    header.kind,
                    recipient.short()
                );
                self.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                Dispatch::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Recipient {} is gone", recipient.short());
                self.registry.release(&recipient, target.id);
                self.counters.dropped_unroutable.fetch_add(1, Ordering::Relaxed);
                Dispatch::RecipientGone
            }
        }
    }

    /// Drop the registration held by this connection
    ///
    /// A connection binds at most the identity recorded in its context, since
    /// registering under a new sender releases the old one. The entry is only
    /// removed if no newer connection has taken the identity over.
    pub fn on_disconnect(&self, ctx: ConnectionContext) {
        self.counters.connections_open.fetch_sub(1, Ordering::Relaxed);
        match ctx.identity {
            Some(identity) => {
                let released = self.registry.release(&identity, ctx.id);
                info!(
                    "Connection {} ({}) closed, registration {}",
                    ctx.id,
                    identity.short(),
                    if released { "removed" } else { "already superseded" }
                );
            }
            None => debug!("Unregistered connection {} closed", ctx.id),
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections_open: self.counters.connections_open.load(Ordering::Relaxed),
            registered: self.registry.len(),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped_malformed: self.counters.dropped_malformed.load(Ordering::Relaxed),
            dropped_unroutable: self.counters.dropped_unroutable.load(Ordering::Relaxed),
            dropped_overflow: self.counters.dropped_overflow.load(Ordering::Relaxed),
        }
    }

    fn register(&self, ctx: &mut ConnectionContext, sender: Identity) {
        if self.registry.bound_to(&sender) == Some(ctx.id) {
            return;
        }

        // One identity per connection: a changed sender releases the old one
        if let Some(previous) = ctx.identity.take() {
            if previous != sender {
                self.registry.release(&previous, ctx.id);
            }
        }

        let handle = ConnectionHandle::new(ctx.id, ctx.tx.clone());
        match self.registry.bind(sender.clone(), handle) {
            Some(displaced) if displaced != ctx.id => info!(
                "{} re-registered on {} (was {})",
                sender.short(),
                ctx.id,
                displaced
            ),
            _ => info!("{} registered on {}", sender.short(), ctx.id),
        }
        ctx.identity = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> Relay {
        Relay::new(RelayConfig::local())
    }

    #[test]
    fn test_register_then_forward() {
        let relay = relay();
        let (mut alice, _alice_rx) = relay.on_connect();
        let (mut bob, mut bob_rx) = relay.on_connect();

        assert_eq!(
            relay.on_message(&mut bob, r#"{"type":"register","senderId":"bob"}"#),
            Dispatch::NoRecipient
        );

        let frame = r#"{"type":"offer","senderId":"alice","recipientId":"bob","offer":{"sdp":"x"}}"#;
        assert_eq!(relay.on_message(&mut alice, frame), Dispatch::Forwarded { to: bob.id() });
        assert_eq!(bob_rx.try_recv().unwrap(), frame);
        assert_eq!(alice.identity().map(|i| i.as_str()), Some("alice"));
    }

    #[test]
    fn test_self_addressed_not_echoed() {
        let relay = relay();
        let (mut alice, mut alice_rx) = relay.on_connect();

        let frame = r#"{"type":"key","senderId":"alice","recipientId":"alice","key":[1]}"#;
        assert_eq!(relay.on_message(&mut alice, frame), Dispatch::SelfAddressed);
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_changed_sender_releases_old_identity() {
        let relay = relay();
        let (mut conn, _rx) = relay.on_connect();

        relay.on_message(&mut conn, r#"{"type":"register","senderId":"alice"}"#);
        relay.on_message(&mut conn, r#"{"type":"register","senderId":"alicia"}"#);

        let registry = relay.registry();
        assert_eq!(registry.bound_to(&Identity::new("alice").unwrap()), None);
        assert_eq!(registry.bound_to(&Identity::new("alicia").unwrap()), Some(conn.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overflow_drops_instead_of_blocking() {
        let relay = Relay::new(RelayConfig::local().with_channel_capacity(1));
        let (mut alice, _alice_rx) = relay.on_connect();
        let (mut bob, _bob_rx) = relay.on_connect();
        relay.on_message(&mut bob, r#"{"type":"register","senderId":"bob"}"#);

        let frame = r#"{"type":"candidate","senderId":"alice","recipientId":"bob","candidate":{}}"#;
        assert!(relay.on_message(&mut alice, frame).is_forwarded());
        assert_eq!(relay.on_message(&mut alice, frame), Dispatch::QueueFull);
        assert_eq!(relay.stats().dropped_overflow, 1);
    }

    #[test]
    fn test_closed_recipient_is_released() {
        let relay = relay();
        let (mut alice, _alice_rx) = relay.on_connect();
        let (mut bob, bob_rx) = relay.on_connect();
        relay.on_message(&mut bob, r#"{"type":"register","senderId":"bob"}"#);

        // Dropping the receiver closes the queue even though senders remain
        drop(bob_rx);
        let frame = r#"{"type":"hangup","senderId":"alice","recipientId":"bob"}"#;
        assert_eq!(relay.on_message(&mut alice, frame), Dispatch::RecipientGone);
        assert_eq!(relay.registry().bound_to(&Identity::new("bob").unwrap()), None);
    }

    #[test]
    fn test_oversized_and_malformed_frames() {
        let relay = Relay::new(RelayConfig::local().with_max_message_bytes(32));
        let (mut conn, _rx) = relay.on_connect();

        assert_eq!(relay.on_message(&mut conn, "{not json"), Dispatch::Malformed);
        assert_eq!(relay.on_message(&mut conn, r#"{"senderId":"a"}"#), Dispatch::Malformed);
        let big = format!(r#"{{"type":"offer","pad":"{}"}}"#, "x".repeat(64));
        assert_eq!(relay.on_message(&mut conn, &big), Dispatch::TooLarge);

        let stats = relay.stats();
        assert_eq!(stats.dropped_malformed, 3);
        assert_eq!(stats.registered, 0);
    }

    #[test]
    fn test_disconnect_updates_stats() {
        let relay = relay();
        let (mut conn, _rx) = relay.on_connect();
        relay.on_message(&mut conn, r#"{"type":"register","senderId":"alice"}"#);
        assert_eq!(relay.stats().connections_open, 1);
        assert_eq!(relay.stats().registered, 1);

        relay.on_disconnect(conn);
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[test]
    fn test_superseded_disconnect_keeps_newer_binding() {
        let relay = relay();
        let register = r#"{"type":"register","senderId":"alice"}"#;
        let (mut old, _old_rx) = relay.on_connect();
        let (mut new, _new_rx) = relay.on_connect();
        relay.on_message(&mut old, register);
        relay.on_message(&mut new, register);
        let new_id = new.id();

        relay.on_disconnect(old);
        assert_eq!(relay.registry().bound_to(&Identity::new("alice").unwrap()), Some(new_id));

        relay.on_disconnect(new);
        assert!(relay.registry().is_empty());
    }
}
