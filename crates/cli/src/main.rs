//! duet command-line tool
//!
//! `duet relay` runs the signaling relay. `duet agent` runs a participant
//! backed by the simulated media and transport, which is enough to watch a
//! negotiation end to end against a live relay.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use duet::agent_core::sim::{AutoAnswer, SimulatedMedia, SimulatedTransportFactory};
use duet::prelude::*;
use duet::signal_core::{log_welcome, parse_log_level};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "duet", version)]
#[command(about = "Signaling relay and call agent for two-party audio/video calls", long_about = None)]
struct Cli {
    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DUET_LOG_LEVEL", global = true)]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listen address, overrides the configuration file
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Run a simulated participant agent
    Agent {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Relay URL, e.g. ws://localhost:8080/ws
        #[arg(long)]
        relay: Option<String>,
        /// Identity to register with; random when omitted
        #[arg(long)]
        id: Option<String>,
        /// Call this identity once connected
        #[arg(long)]
        call: Option<String>,
        /// How to answer incoming calls
        #[arg(long, value_enum, default_value = "accept")]
        answer: AnswerMode,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AnswerMode {
    Accept,
    Reject,
    Ignore,
}

impl AnswerMode {
    fn handler(self) -> AutoAnswer {
        match self {
            AnswerMode::Accept => AutoAnswer::accept(),
            AnswerMode::Reject => AutoAnswer::reject(),
            AnswerMode::Ignore => AutoAnswer::ignore(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = parse_log_level(&cli.log_level)?;
    let mut logging = LoggingConfig::new(level);
    if cli.json_logs {
        logging = logging.with_json();
    }
    setup_logging(&logging)?;
    log_welcome("duet", duet::VERSION);

    match cli.command {
        Commands::Relay { config, bind } => run_relay(config, bind).await,
        Commands::Agent {
            config,
            relay,
            id,
            call,
            answer,
        } => run_agent(config, relay, id, call, answer).await,
    }
}

async fn run_relay(config: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<()> {
    let mut config = match config {
        Some(path) => RelayConfig::from_file(&path)
            .with_context(|| format!("Failed to load relay config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(addr) = bind {
        config = config.with_bind_address(addr);
    }
    config.validate()?;

    let server = RelayServer::bind(config).await?;
    info!("Relay listening on ws://{}/ws", server.local_addr());
    server.run().await?;
    Ok(())
}

async fn run_agent(
    config: Option<PathBuf>,
    relay: Option<String>,
    id: Option<String>,
    call: Option<String>,
    answer: AnswerMode,
) -> Result<()> {
    let mut config = match config {
        Some(path) => AgentConfig::from_file(&path)
            .with_context(|| format!("Failed to load agent config from {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(url) = relay {
        config = config.with_relay_url(url);
    }
    if let Some(name) = id {
        config = config.with_identity(Identity::new(name)?);
    }

    let agent = AgentBuilder::new()
        .with_config(config)
        .with_media_source(Arc::new(SimulatedMedia::new()))
        .with_transport_factory(Arc::new(SimulatedTransportFactory::new()))
        .with_call_handler(Arc::new(answer.handler()))
        .connect()
        .await
        .context("Failed to start agent")?;
    info!("Registered as {}", agent.identity());

    let mut events = agent.subscribe();
    if let Some(remote) = call {
        let remote = Identity::new(remote)?;
        agent.call(&remote).await?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, hanging up");
                break;
            }
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged { remote, from, to }) => info!("{}: {} -> {}", remote, from, to),
                Ok(CallEvent::IncomingCall { remote }) => info!("Incoming call from {}", remote),
                Ok(CallEvent::NegotiationFailed { remote, reason }) => warn!("Call with {} failed: {}", remote, reason),
                Ok(CallEvent::Ended { remote, reason }) => info!("Call with {} ended: {}", remote, reason),
                Ok(CallEvent::RelayDisconnected) => warn!("Relay connection lost"),
                Ok(CallEvent::RemoteKey { .. }) => {}
                Err(RecvError::Lagged(n)) => warn!("Missed {} call events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    agent.shutdown().await?;
    Ok(())
}
