//! WebSocket surface of the relay
//!
//! Routes:
//! - `GET /` and `GET /ws`: WebSocket upgrade into the relay
//! - `GET /health`: liveness probe
//! - `GET /stats`: [`RelayStats`] as JSON
//!
//! Each connection runs as one task that reads frames in order and hands them
//! to [`Relay::on_message`], plus a writer task draining the connection's
//! outbound queue into the socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::relay::{Relay, RelayStats};

#[derive(Clone)]
struct ServerState {
    relay: Arc<Relay>,
    shutdown: watch::Receiver<bool>,
}

/// A bound, not yet running relay server
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Arc<Relay>,
}

impl RelayServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay listening on ws://{}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            relay: Arc::new(Relay::new(config)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Serve until `shutdown` resolves, then close every open connection
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (close_tx, close_rx) = watch::channel(false);
        let app = router(self.relay.clone(), close_rx);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Relay shutting down");
                let _ = close_tx.send(true);
            })
            .await?;

        info!("Relay on {} stopped", self.local_addr);
        Ok(())
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Serve on a background task
    pub fn spawn(self) -> RelayServerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let relay = self.relay.clone();

        let task = tokio::spawn(self.run_until(async move {
            // Dropping the handle also stops the server
            let _ = shutdown_rx.changed().await;
        }));

        RelayServerHandle {
            local_addr,
            relay,
            shutdown_tx,
            task,
        }
    }
}

/// Handle to a relay running on a background task
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl RelayServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL agents should connect to
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn stats(&self) -> RelayStats {
        self.relay.stats()
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Stop accepting connections, close the open ones and wait for the server task
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| RelayError::server(e.to_string()))?
    }
}

fn router(relay: Arc<Relay>, shutdown: watch::Receiver<bool>) -> Router {
    let state = ServerState { relay, shutdown };

    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<ServerState>) -> Json<RelayStats> {
    Json(state.relay.stats())
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sink, mut stream) = socket.split();
    let (mut ctx, mut outbound) = state.relay.on_connect();
    let mut shutdown = state.shutdown;

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    if *shutdown.borrow() {
        state.relay.on_disconnect(ctx);
        send_task.abort();
        return;
    }

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    trace!("{} <- {}", ctx.id(), text);
                    state.relay.on_message(&mut ctx, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", ctx.id(), e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    state.relay.on_disconnect(ctx);
    send_task.abort();
}
