//! Routing properties of the relay core, checked against a small model

use duet_relay_core::{ConnectionContext, Dispatch, Relay, RelayConfig};
use duet_signal_core::Identity;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

const SLOTS: usize = 4;
const NAMES: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    /// Send a frame from a connection slot
    Send {
        from: usize,
        sender: Option<usize>,
        recipient: Option<usize>,
    },
    /// Close the connection in a slot and open a fresh one in its place
    Cycle { slot: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (
            0..SLOTS,
            proptest::option::of(0..NAMES.len()),
            proptest::option::of(0..NAMES.len())
        )
            .prop_map(|(from, sender, recipient)| Op::Send { from, sender, recipient }),
        1 => (0..SLOTS).prop_map(|slot| Op::Cycle { slot }),
    ]
}

fn frame(seq: usize, sender: Option<usize>, recipient: Option<usize>) -> String {
    let mut value = serde_json::json!({ "type": "candidate", "candidate": { "seq": seq } });
    if let Some(s) = sender {
        value["senderId"] = NAMES[s].into();
    }
    if let Some(r) = recipient {
        value["recipientId"] = NAMES[r].into();
    }
    value.to_string()
}

fn identity(index: usize) -> Identity {
    Identity::new(NAMES[index]).unwrap()
}

/// Expected registry contents: name index -> slot
#[derive(Default)]
struct Model {
    bound: HashMap<usize, usize>,
    declared: [Option<usize>; SLOTS],
}

impl Model {
    fn register(&mut self, slot: usize, name: usize) {
        if self.bound.get(&name) == Some(&slot) {
            return;
        }
        if let Some(prev) = self.declared[slot].take() {
            if prev != name && self.bound.get(&prev) == Some(&slot) {
                self.bound.remove(&prev);
            }
        }
        self.bound.insert(name, slot);
        self.declared[slot] = Some(name);
    }

    fn disconnect(&mut self, slot: usize) {
        self.bound.retain(|_, s| *s != slot);
        self.declared[slot] = None;
    }
}

fn run_model(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let relay = Relay::new(RelayConfig::local().with_channel_capacity(1024));
    let mut conns: Vec<(ConnectionContext, mpsc::Receiver<String>)> =
        (0..SLOTS).map(|_| relay.on_connect()).collect();
    let mut model = Model::default();

    for (seq, op) in ops.into_iter().enumerate() {
        match op {
            Op::Send {
                from,
                sender,
                recipient,
            } => {
                let raw = frame(seq, sender, recipient);
                let dispatch = relay.on_message(&mut conns[from].0, &raw);

                if let Some(name) = sender {
                    model.register(from, name);
                }

                match recipient.map(|r| model.bound.get(&r).copied()) {
                    None => prop_assert_eq!(dispatch, Dispatch::NoRecipient),
                    Some(None) => prop_assert_eq!(dispatch, Dispatch::UnknownRecipient),
                    Some(Some(target)) if target == from => {
                        prop_assert_eq!(dispatch, Dispatch::SelfAddressed)
                    }
                    Some(Some(target)) => {
                        let to = conns[target].0.id();
                        prop_assert_eq!(dispatch, Dispatch::Forwarded { to });
                        prop_assert_eq!(conns[target].1.try_recv().ok(), Some(raw));
                    }
                }

                // Nobody else saw the frame
                for (_, rx) in conns.iter_mut() {
                    prop_assert!(rx.try_recv().is_err());
                }
            }
            Op::Cycle { slot } => {
                let fresh = relay.on_connect();
                let (old_ctx, _old_rx) = std::mem::replace(&mut conns[slot], fresh);
                let old_id = old_ctx.id();
                relay.on_disconnect(old_ctx);
                model.disconnect(slot);

                let registry = relay.registry();
                prop_assert!(registry
                    .identities()
                    .iter()
                    .all(|i| registry.bound_to(i) != Some(old_id)));
            }
        }

        for index in 0..NAMES.len() {
            let expected = model.bound.get(&index).map(|slot| conns[*slot].0.id());
            prop_assert_eq!(relay.registry().bound_to(&identity(index)), expected);
        }
    }

    for (ctx, _) in conns {
        relay.on_disconnect(ctx);
    }
    prop_assert!(relay.registry().is_empty());
    prop_assert_eq!(relay.stats().connections_open, 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_routing_matches_model(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        run_model(ops)?;
    }

    #[test]
    fn prop_per_sender_order_preserved(pattern in proptest::collection::vec(any::<bool>(), 1..64)) {
        let relay = Relay::new(RelayConfig::local().with_channel_capacity(128));
        let (mut alice, _a) = relay.on_connect();
        let (mut carol, _c) = relay.on_connect();
        let (mut bob, mut bob_rx) = relay.on_connect();
        relay.on_message(&mut bob, r#"{"type":"register","senderId":"bob"}"#);

        let mut sent_by_alice = Vec::new();
        let mut sent_by_carol = Vec::new();
        for (seq, from_alice) in pattern.iter().enumerate() {
            if *from_alice {
                let raw = frame(seq, Some(0), Some(1));
                prop_assert!(relay.on_message(&mut alice, &raw).is_forwarded());
                sent_by_alice.push(raw);
            } else {
                let raw = frame(seq, Some(2), Some(1));
                prop_assert!(relay.on_message(&mut carol, &raw).is_forwarded());
                sent_by_carol.push(raw);
            }
        }

        let mut received = Vec::new();
        while let Ok(raw) = bob_rx.try_recv() {
            received.push(raw);
        }
        let from_alice: Vec<_> = received.iter().filter(|r| r.contains("\"alice\"")).cloned().collect();
        let from_carol: Vec<_> = received.iter().filter(|r| r.contains("\"carol\"")).cloned().collect();
        prop_assert_eq!(from_alice, sent_by_alice);
        prop_assert_eq!(from_carol, sent_by_carol);
    }
}

#[test]
fn test_key_then_offer_reaches_only_bob() {
    let relay = Relay::new(RelayConfig::local());
    let (mut alice, mut alice_rx) = relay.on_connect();
    let (mut bob, mut bob_rx) = relay.on_connect();
    let (mut carol, mut carol_rx) = relay.on_connect();
    relay.on_message(&mut alice, r#"{"type":"register","senderId":"alice"}"#);
    relay.on_message(&mut bob, r#"{"type":"register","senderId":"bob"}"#);
    relay.on_message(&mut carol, r#"{"type":"register","senderId":"carol"}"#);

    let key = r#"{"type":"key","senderId":"alice","recipientId":"bob","key":[4,5,6]}"#;
    let offer = r#"{"type":"offer","senderId":"alice","recipientId":"bob","offer":{"type":"offer","sdp":"v=0"}}"#;
    assert!(relay.on_message(&mut alice, key).is_forwarded());
    assert!(relay.on_message(&mut alice, offer).is_forwarded());

    assert_eq!(bob_rx.try_recv().unwrap(), key);
    assert_eq!(bob_rx.try_recv().unwrap(), offer);
    assert!(bob_rx.try_recv().is_err());
    assert!(carol_rx.try_recv().is_err());

    // Reply without a sender id still routes by recipient
    let answer = r#"{"type":"answer","recipientId":"alice","answer":{"type":"answer","sdp":"v=0"}}"#;
    assert!(relay.on_message(&mut bob, answer).is_forwarded());
    assert_eq!(alice_rx.try_recv().unwrap(), answer);
    assert!(carol_rx.try_recv().is_err());
}

#[test]
fn test_unregistered_recipient_dropped_silently() {
    let relay = Relay::new(RelayConfig::local());
    let (mut alice, mut alice_rx) = relay.on_connect();

    let frame = r#"{"type":"offer","senderId":"alice","recipientId":"carol","offer":{}}"#;
    assert_eq!(relay.on_message(&mut alice, frame), Dispatch::UnknownRecipient);
    assert!(alice_rx.try_recv().is_err());
    assert_eq!(relay.stats().dropped_unroutable, 1);
    assert_eq!(relay.stats().registered, 1);
}

#[test]
fn test_unknown_kind_passes_through_unchanged() {
    let relay = Relay::new(RelayConfig::local());
    let (mut alice, _alice_rx) = relay.on_connect();
    let (mut bob, mut bob_rx) = relay.on_connect();
    relay.on_message(&mut bob, r#"{"type":"register","senderId":"bob"}"#);

    let frame = r#"{"type":"x-custom","senderId":"alice","recipientId":"bob","blob":[1,  2]}"#;
    assert!(relay.on_message(&mut alice, frame).is_forwarded());
    assert_eq!(bob_rx.try_recv().unwrap(), frame);
}

// Many connections fight over one identity on a multi-threaded runtime. Once a
// connection's disconnect returns, no binding may still name it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_leave_no_stale_bindings() {
    let relay = Arc::new(Relay::new(RelayConfig::local()));
    let shared = Identity::new("shared").unwrap();

    let mut tasks = Vec::new();
    for n in 0..64 {
        let relay = relay.clone();
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            let own = Identity::new(format!("peer-{}", n)).unwrap();
            let (mut ctx, mut rx) = relay.on_connect();

            for round in 0..20 {
                let sender = if round % 2 == 0 { &shared } else { &own };
                let raw = serde_json::json!({
                    "type": "candidate",
                    "senderId": sender.as_str(),
                    "recipientId": "shared",
                    "candidate": { "seq": round },
                })
                .to_string();
                relay.on_message(&mut ctx, &raw);
                while rx.try_recv().is_ok() {}
                tokio::task::yield_now().await;
            }

            let conn = ctx.id();
            relay.on_disconnect(ctx);
            assert_ne!(relay.registry().bound_to(&shared), Some(conn));
            assert_ne!(relay.registry().bound_to(&own), Some(conn));
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert!(relay.registry().is_empty());
    let stats = relay.stats();
    assert_eq!(stats.connections_open, 0);
    assert_eq!(stats.registered, 0);
}
