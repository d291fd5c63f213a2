//! Agents talking through a real relay server over WebSockets

mod common;

use common::{eventually, id, STEP};
use duet_agent_core::sim::{AutoAnswer, SimulatedMedia, SimulatedTransportFactory};
use duet_agent_core::{AgentBuilder, AgentConfig, AgentError, AgentHandle, CallEvent, CallState, EndReason};
use duet_relay_core::{RelayConfig, RelayServer, RelayServerHandle};
use serial_test::serial;
use std::sync::Arc;

async fn start_relay() -> RelayServerHandle {
    RelayServer::bind(RelayConfig::local()).await.unwrap().spawn()
}

async fn connect(relay: &RelayServerHandle, name: &str, handler: AutoAnswer) -> AgentHandle {
    let config = AgentConfig::new(relay.url()).with_identity(id(name));
    AgentBuilder::new()
        .with_config(config)
        .with_media_source(Arc::new(SimulatedMedia::new()))
        .with_transport_factory(Arc::new(SimulatedTransportFactory::new()))
        .with_call_handler(Arc::new(handler))
        .connect()
        .await
        .unwrap()
}

async fn wait_registered(relay: &RelayServerHandle, count: usize) {
    eventually("agents registered", move || async move { relay.stats().registered == count }).await;
}

#[tokio::test]
#[serial]
async fn test_call_connects_and_hangs_up() {
    let relay = start_relay().await;
    let alice = connect(&relay, "alice", AutoAnswer::accept()).await;
    let bob = connect(&relay, "bob", AutoAnswer::accept()).await;
    wait_registered(&relay, 2).await;

    alice.call(&id("bob")).await.unwrap();
    alice.wait_for_state(&id("bob"), CallState::Connected, STEP).await.unwrap();
    bob.wait_for_state(&id("alice"), CallState::Connected, STEP).await.unwrap();

    let alice_view = alice.snapshot(&id("bob")).await.unwrap();
    let bob_view = bob.snapshot(&id("alice")).await.unwrap();
    assert!(alice_view.remote_public_key.is_some());
    assert_eq!(alice_view.remote_public_key, bob_view.local_public_key);
    assert_eq!(bob_view.remote_public_key, alice_view.local_public_key);

    alice.hangup(&id("bob")).await.unwrap();
    bob.wait_for_state(&id("alice"), CallState::Ended, STEP).await.unwrap();

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
    relay.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_busy_callee_rejects_third_party() {
    let relay = start_relay().await;
    let alice = connect(&relay, "alice", AutoAnswer::accept()).await;
    let bob = connect(&relay, "bob", AutoAnswer::accept()).await;
    let carol = connect(&relay, "carol", AutoAnswer::accept()).await;
    wait_registered(&relay, 3).await;

    alice.call(&id("bob")).await.unwrap();
    bob.wait_for_state(&id("alice"), CallState::Connected, STEP).await.unwrap();

    let mut events = carol.subscribe();
    carol.call(&id("bob")).await.unwrap();
    let ended = tokio::time::timeout(STEP, async {
        loop {
            if let Ok(CallEvent::Ended { remote, reason }) = events.recv().await {
                return (remote, reason);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ended.0, id("bob"));
    assert_eq!(
        ended.1,
        EndReason::Rejected {
            reason: Some("busy".to_string())
        }
    );
    assert_eq!(bob.state(&id("alice")).await, Some(CallState::Connected));

    relay.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_relay_shutdown_ends_pending_call() {
    let relay = start_relay().await;
    let alice = connect(&relay, "alice", AutoAnswer::accept()).await;
    wait_registered(&relay, 1).await;

    // Nobody is registered as dave, so the offer goes unanswered
    alice.call(&id("dave")).await.unwrap();
    alice.wait_for_state(&id("dave"), CallState::OfferSent, STEP).await.unwrap();

    relay.shutdown().await.unwrap();
    alice.wait_for_state(&id("dave"), CallState::Ended, STEP).await.unwrap();

    let agent = &alice;
    eventually("relay marked down", move || async move { !agent.is_relay_connected().await }).await;
    let result = alice.call(&id("erin")).await;
    assert!(matches!(result, Err(AgentError::RelayUnavailable)));
}

#[tokio::test]
#[serial]
async fn test_connect_to_missing_relay_fails() {
    let result = AgentBuilder::new()
        .with_relay_url("ws://127.0.0.1:9/ws")
        .with_media_source(Arc::new(SimulatedMedia::new()))
        .with_transport_factory(Arc::new(SimulatedTransportFactory::new()))
        .with_call_handler(Arc::new(AutoAnswer::accept()))
        .connect()
        .await;
    assert!(matches!(result, Err(AgentError::RelayConnect { .. })));
}
