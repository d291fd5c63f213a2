//! Shared helpers for agent integration tests

#![allow(dead_code)]

use duet_agent_core::sim::{AutoAnswer, SimulatedMedia, SimulatedTransportFactory, TransportStats};
use duet_agent_core::{AgentBuilder, AgentHandle, CallState, RelayEvent, RelayLink, RelayLinkPeer};
use duet_relay_core::{Relay, RelayConfig};
use duet_signal_core::{Candidate, Identity, MessageKind, Payload, PublicKey, SessionDescription, SignalingMessage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const STEP: Duration = Duration::from_secs(2);

pub fn id(name: &str) -> Identity {
    Identity::new(name).unwrap()
}

pub fn sdp(kind: &str) -> SessionDescription {
    SessionDescription::from_sdp(kind, format!("v=0\r\ns=remote-{}\r\n", kind))
}

pub fn candidate(n: u16) -> Candidate {
    Candidate::from_parts(format!("candidate:{} 1 UDP 1 192.0.2.1 {} typ host", n, 6000 + n), Some("0"), Some(0))
}

/// Message from `sender` to `recipient` without building it by hand
pub fn from(sender: &str, recipient: &str, payload: Payload) -> SignalingMessage {
    SignalingMessage {
        sender_id: Some(id(sender)),
        recipient_id: Some(id(recipient)),
        payload,
    }
}

/// Message as the reference browser agent sends it: no sender id
pub fn anonymous(recipient: &str, payload: Payload) -> SignalingMessage {
    SignalingMessage {
        sender_id: None,
        recipient_id: Some(id(recipient)),
        payload,
    }
}

pub fn offer_payload() -> Payload {
    Payload::Offer { offer: sdp("offer") }
}

pub fn answer_payload() -> Payload {
    Payload::Answer { answer: sdp("answer") }
}

pub fn key_payload(bytes: &[u8]) -> Payload {
    Payload::Key {
        key: PublicKey::new(bytes.to_vec()),
    }
}

/// Poll `check` until it holds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(STEP, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// An agent whose relay link is driven directly by the test
pub struct Harness {
    pub agent: AgentHandle,
    pub peer: RelayLinkPeer,
    pub media: Arc<SimulatedMedia>,
    pub transports: Arc<TransportStats>,
    pub handler: Arc<AutoAnswer>,
}

pub fn harness(name: &str, handler: AutoAnswer) -> Harness {
    harness_with(name, handler, |builder| builder)
}

pub fn harness_with(
    name: &str,
    handler: AutoAnswer,
    configure: impl FnOnce(AgentBuilder) -> AgentBuilder,
) -> Harness {
    let media = Arc::new(SimulatedMedia::new());
    let factory = SimulatedTransportFactory::new();
    let transports = factory.stats();
    let handler = Arc::new(handler);
    let (link, peer) = RelayLink::pair(64);

    let builder = AgentBuilder::new()
        .with_identity(id(name))
        .with_media_source(media.clone())
        .with_transport_factory(Arc::new(factory))
        .with_call_handler(handler.clone());
    let agent = configure(builder).start(link).unwrap();

    Harness {
        agent,
        peer,
        media,
        transports,
        handler,
    }
}

impl Harness {
    pub async fn deliver(&self, message: SignalingMessage) {
        self.peer
            .to_agent
            .send(RelayEvent::Message(message))
            .await
            .unwrap();
    }

    pub async fn lose_relay(&self) {
        self.peer.to_agent.send(RelayEvent::Disconnected).await.unwrap();
    }

    /// Next frame the agent sent, skipping its registration
    pub async fn next_message(&mut self) -> SignalingMessage {
        loop {
            let message = tokio::time::timeout(STEP, self.peer.from_agent.recv())
                .await
                .expect("agent sent nothing")
                .expect("relay link closed");
            if message.kind() != MessageKind::Register {
                return message;
            }
        }
    }

    /// Next frame of `kind`, skipping everything else
    pub async fn next_of_kind(&mut self, kind: MessageKind) -> SignalingMessage {
        loop {
            let message = self.next_message().await;
            if message.kind() == kind {
                return message;
            }
        }
    }

    pub async fn assert_no_message_of_kind(&mut self, kind: MessageKind) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
        while let Ok(Some(message)) = tokio::time::timeout_at(deadline, self.peer.from_agent.recv()).await {
            assert_ne!(message.kind(), kind, "unexpected {:?}", message);
        }
    }

    pub async fn wait_for(&self, remote: &str, state: CallState) {
        self.agent
            .wait_for_state(&id(remote), state, STEP)
            .await
            .unwrap_or_else(|e| panic!("{}: {}", remote, e));
    }
}

/// Routes agents through a real relay core, without sockets
pub struct MemoryRelay {
    relay: Arc<Relay>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            relay: Arc::new(Relay::new(RelayConfig::local())),
        }
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// A relay link backed by a fresh relay connection
    pub fn attach(&self) -> RelayLink {
        let (link, peer) = RelayLink::pair(64);
        let RelayLinkPeer {
            mut from_agent,
            to_agent,
        } = peer;
        let (mut ctx, mut outbound) = self.relay.on_connect();

        let relay = self.relay.clone();
        tokio::spawn(async move {
            while let Some(message) = from_agent.recv().await {
                if let Ok(frame) = message.encode() {
                    relay.on_message(&mut ctx, &frame);
                }
            }
            relay.on_disconnect(ctx);
        });

        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if let Ok(message) = SignalingMessage::decode(&frame) {
                    if to_agent.send(RelayEvent::Message(message)).await.is_err() {
                        break;
                    }
                }
            }
        });

        link
    }
}

/// A fully simulated agent attached to a [`MemoryRelay`]
pub struct SimAgent {
    pub agent: AgentHandle,
    pub media: Arc<SimulatedMedia>,
    pub transports: Arc<TransportStats>,
    pub handler: Arc<AutoAnswer>,
}

pub fn sim_agent(relay: &MemoryRelay, name: &str, handler: AutoAnswer) -> SimAgent {
    let media = Arc::new(SimulatedMedia::new());
    let factory = SimulatedTransportFactory::new();
    let transports = factory.stats();
    let handler = Arc::new(handler);

    let agent = AgentBuilder::new()
        .with_identity(id(name))
        .with_media_source(media.clone())
        .with_transport_factory(Arc::new(factory))
        .with_call_handler(handler.clone())
        .start(relay.attach())
        .unwrap();

    SimAgent {
        agent,
        media,
        transports,
        handler,
    }
}
