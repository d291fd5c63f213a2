//! # duet-relay-core
//!
//! Signaling relay for duet participant agents.
//!
//! The relay keeps one mapping from participant [`Identity`] to open
//! WebSocket connection and forwards every text frame to the connection
//! registered under the frame's `recipientId`. It never stores frames, never
//! acknowledges them and never interprets anything beyond the routing
//! header: delivery is at most once and best effort.
//!
//! - [`Registry`]: the shared identity to connection map
//! - [`Relay`]: socket-agnostic routing (`on_connect` / `on_message` / `on_disconnect`)
//! - [`RelayServer`]: the axum WebSocket service around it
//!
//! ```no_run
//! use duet_relay_core::{RelayConfig, RelayServer};
//!
//! # async fn example() -> duet_relay_core::Result<()> {
//! let server = RelayServer::bind(RelayConfig::default()).await?;
//! server.run().await
//! # }
//! ```
//!
//! [`Identity`]: duet_signal_core::Identity

pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use registry::{ConnectionHandle, ConnectionId, Registry};
pub use relay::{ConnectionContext, Dispatch, Relay, RelayStats};
pub use server::{RelayServer, RelayServerHandle};
