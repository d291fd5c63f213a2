//! Connection to the relay
//!
//! The agent core never touches a socket. It talks to the relay through a
//! [`RelayLink`]: a sender for outbound [`SignalingMessage`]s and a receiver
//! of [`RelayEvent`]s. [`RelayClient::connect`] backs a link with a
//! WebSocket; [`RelayLink::pair`] backs it with plain channels.

use duet_signal_core::SignalingMessage;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Something the relay connection produced
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(SignalingMessage),
    /// The connection is gone; no further events follow
    Disconnected,
}

/// The agent's side of a relay connection
#[derive(Debug)]
pub struct RelayLink {
    pub outbound: mpsc::Sender<SignalingMessage>,
    pub inbound: mpsc::Receiver<RelayEvent>,
}

/// The far side of an in-memory [`RelayLink`]
#[derive(Debug)]
pub struct RelayLinkPeer {
    /// Frames the agent sent
    pub from_agent: mpsc::Receiver<SignalingMessage>,
    /// Deliver events to the agent
    pub to_agent: mpsc::Sender<RelayEvent>,
}

impl RelayLink {
    /// In-memory link, for tests and embedding
    pub fn pair(capacity: usize) -> (RelayLink, RelayLinkPeer) {
        let (outbound, from_agent) = mpsc::channel(capacity.max(1));
        let (to_agent, inbound) = mpsc::channel(capacity.max(1));
        (
            RelayLink { outbound, inbound },
            RelayLinkPeer {
                from_agent,
                to_agent,
            },
        )
    }
}

pub struct RelayClient;

impl RelayClient {
    /// Open a WebSocket to the relay and wrap it in a [`RelayLink`]
    ///
    /// Frames that do not parse as signaling messages are dropped. When the
    /// socket closes or errors, a single [`RelayEvent::Disconnected`] is
    /// delivered. Dropping every clone of `outbound` closes the socket.
    pub async fn connect(url: &str, capacity: usize) -> Result<RelayLink> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| AgentError::relay_connect(url, e.to_string()))?;
        info!("Connected to relay {}", url);

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<SignalingMessage>(capacity.max(1));
        let (inbound_tx, inbound) = mpsc::channel(capacity.max(1));

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match message.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to encode {} message: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::decode(&text) {
                        Ok(message) => {
                            if inbound_tx.send(RelayEvent::Message(message)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!("Dropping malformed frame from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            info!("Relay connection closed");
            let _ = inbound_tx.send(RelayEvent::Disconnected).await;
        });

        Ok(RelayLink { outbound, inbound })
    }
}
