//! End-to-end tests for the Rapport flow engine.
//!
//! Each test drives a whole agent: declare graph -> register hooks and
//! handlers -> feed envelopes -> inspect store, events, and transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use rapport_flow::{
    drain_events, hook_fn, parse_route, receive_fn, Action, AgentBuilder, AgentConfig,
    ArrowStyle, Channel, ChannelStateSync, ChannelTransport, ControlGate, Direction, Envelope, Event, FlowAgent, FlowEvent,
    FlowGraph, Inbound, ListeningGate, MatchRule, Matcher, Message, Node, OutboxEntry,
    OutboxNotice, Payload, PeerStateSync, ReceiveHandler, RecordingTransport, SendGate,
    StateSnapshot, StateSync,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn handshake() -> FlowGraph {
    FlowGraph::builder(ArrowStyle::default())
        .route("listen --> register")
        .route("register --[ ok ]--> contact")
        .route("register --[ ban ]--> ban")
        .route("contact --[ ok ]--> friend")
        .trigger("go")
        .build()
        .expect("handshake graph should build")
}

fn envelope(from: &str, to: Option<&str>, text: &str) -> Envelope {
    Envelope::new(
        "127.0.0.1:5000",
        json!({ "from": from, "to": to, "message": text }),
    )
}

/// Receive handler that counts calls and never fires.
fn counter() -> (Arc<AtomicUsize>, impl ReceiveHandler) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler = receive_fn(move |_call| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    });
    (calls, handler)
}

fn peer_agent(config: AgentConfig, transport: Arc<RecordingTransport>) -> AgentBuilder {
    let builder = FlowAgent::builder(config, handshake()).standard_hooks();
    let sync = PeerStateSync::new(builder.store().clone(), "relations", "register");
    builder
        .state_sync(sync)
        .initial_state("register")
        .transport(transport)
}

// ---------------------------------------------------------------------------
// Fresh peer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fresh_peer_starts_in_default_state() {
    let transport = Arc::new(RecordingTransport::new());
    let agent = peer_agent(AgentConfig::new("Me"), transport).build().unwrap();

    let report = agent.handle_envelope(envelope("Agent_7", None, "hi")).await;
    assert!(report.accepted);
    assert_eq!(
        report.snapshot,
        Some(StateSnapshot::PerPeer(BTreeMap::from([(
            "Agent_7".to_string(),
            Node::from("register")
        )])))
    );

    let snapshot = agent.store().snapshot().await.unwrap();
    let row = snapshot.peer("Agent_7").expect("peer row");
    assert_eq!(row.views["relations"], "register");
    assert_eq!(row.last_message.as_deref(), Some("hi"));
    assert!(row.last_seen.is_some());
}

// ---------------------------------------------------------------------------
// Hook drop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropped_message_reaches_no_handler() {
    let transport = Arc::new(RecordingTransport::new());
    let (calls, handler) = counter();
    let agent = peer_agent(AgentConfig::new("Me"), transport)
        .hook(
            Direction::Receive,
            5,
            hook_fn("spam_filter", |payload| async move {
                let spam = matches!(&payload, Payload::Structured(m) if m.text().contains("spam"));
                Ok((!spam).then_some(payload))
            }),
        )
        .on_receive("register --> contact", handler)
        .unwrap()
        .build()
        .unwrap();
    let mut rx = agent.events().subscribe();

    let report = agent.handle_envelope(envelope("Alice", None, "buy spam")).await;
    assert!(!report.accepted);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        drain_events(&mut rx),
        vec![FlowEvent::MessageDropped {
            direction: "receive".into(),
            stage: "spam_filter".into(),
            priority: 5,
        }]
    );

    agent.handle_envelope(envelope("Alice", None, "hello")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Edge transition + gated send with an empty outbox
// ---------------------------------------------------------------------------

#[tokio::test]
async fn edge_transition_fires_gated_send() {
    let transport = Arc::new(RecordingTransport::new());
    let builder = peer_agent(AgentConfig::new("Me"), transport.clone());
    let ok = builder.trigger("ok").unwrap();
    let agent = builder
        .on_receive(
            "register --> contact",
            receive_fn(|call| async move {
                if call.inbound.text() == "hello" {
                    Ok(Some(Event::Move(call.triggers.get("ok")?)))
                } else {
                    Ok(None)
                }
            }),
        )
        .unwrap()
        .on_send_gated(
            "register --> contact",
            SendGate::new([Action::Move], [ok]),
            OutboxNotice::new("contact", "nice to meet you"),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut rx = agent.events().subscribe();

    let report = agent.handle_envelope(envelope("Alice", Some("Me"), "hello")).await;
    let decision = report.transitions().next().expect("one transition");
    assert_eq!(decision.next_state(), "contact");
    assert_eq!(
        agent.store().get("relations", "Alice").await.unwrap(),
        Some("contact".into())
    );

    // Nothing was queued, so the gated sender drains an empty outbox.
    let sent = agent.run_gated_sends().await;
    assert_eq!(sent.produced, 0);
    assert_eq!(sent.attempted(), 0);
    assert!(transport.sent().is_empty());

    let events = drain_events(&mut rx);
    assert!(events.contains(&FlowEvent::Transitioned {
        key: "Alice".into(),
        from_state: "register".into(),
        to_state: "contact".into(),
        trigger: "ok".into(),
    }));
    assert!(events.contains(&FlowEvent::OutboxDrained {
        outbox: "contact".into(),
        entries: 0,
    }));

    // Activations are consumed by the send cycle.
    assert_eq!(agent.run_gated_sends().await, Default::default());
}

// ---------------------------------------------------------------------------
// Priority ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hooks_run_in_ascending_priority() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let tap = |label: &'static str| {
        let order = Arc::clone(&order);
        hook_fn(label, move |payload| {
            let order = Arc::clone(&order);
            async move {
                order.lock().unwrap().push(format!("{label}:{}", payload.kind()));
                Ok(Some(payload))
            }
        })
    };

    let transport = Arc::new(RecordingTransport::new());
    let agent = peer_agent(AgentConfig::new("Me"), transport)
        .hook(Direction::Receive, 2, tap("late"))
        .hook(Direction::Receive, -1, tap("early"))
        .hook(Direction::Receive, 1, tap("tie_first"))
        .hook(Direction::Receive, 1, tap("tie_second"))
        .build()
        .unwrap();

    agent.handle_envelope(envelope("Alice", None, "hi")).await;
    assert_eq!(
        *order.lock().unwrap(),
        vec![
            "early:envelope",
            "tie_first:structured",
            "tie_second:structured",
            "late:structured",
        ]
    );
}

// ---------------------------------------------------------------------------
// Addressing and allowlist
// ---------------------------------------------------------------------------

#[tokio::test]
async fn misaddressed_messages_never_reach_handlers() {
    let transport = Arc::new(RecordingTransport::new());
    let (calls, handler) = counter();
    let agent = peer_agent(AgentConfig::new("Me"), transport)
        .on_receive("register", handler)
        .unwrap()
        .build()
        .unwrap();

    assert!(!agent.handle_envelope(envelope("Alice", Some("Bob"), "hi")).await.accepted);
    let no_to = Envelope::new("x", json!({ "from": "Alice", "message": "hi" }));
    assert!(!agent.handle_envelope(no_to).await.accepted);
    let not_object = Envelope::new("x", json!(42));
    assert!(!agent.handle_envelope(not_object).await.accepted);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(agent.handle_envelope(envelope("Alice", Some("Me"), "hi")).await.accepted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_sender_is_rejected_once() {
    let config = AgentConfig {
        allowlist: vec!["Agent".into()],
        ..AgentConfig::new("Me")
    };
    let transport = Arc::new(RecordingTransport::new());
    let (calls, handler) = counter();
    let agent = peer_agent(config, transport)
        .on_receive("register", handler)
        .unwrap()
        .build()
        .unwrap();
    let mut rx = agent.events().subscribe();

    agent.handle_envelope(envelope("Mallory", None, "hi")).await;
    let rejections = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, FlowEvent::SenderRejected { .. }))
        .count();
    assert_eq!(rejections, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(agent.store().view("relations").await.unwrap().is_empty());

    agent.handle_envelope(envelope("Agent_2", None, "hi")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Upload idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_is_idempotent() {
    let transport = Arc::new(RecordingTransport::new());
    let agent = peer_agent(AgentConfig::new("Me"), transport).build().unwrap();
    let sync = PeerStateSync::new(agent.store().clone(), "relations", "register");
    let inbound = Inbound::Message(Message {
        from: Some("Alice".into()),
        ..Message::broadcast("hi")
    });

    let first = sync.upload_states(&inbound).await.unwrap();
    let second = sync.upload_states(&inbound).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(agent.store().view("relations").await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Outbox exactly-once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outbox_entries_are_attempted_exactly_once() {
    let transport = Arc::new(RecordingTransport::failing());
    let builder = peer_agent(AgentConfig::new("Me"), transport.clone());
    let ban = builder.trigger("ban").unwrap();
    let agent = builder
        .on_receive(
            "register --> ban",
            receive_fn(|call| async move { Ok(Some(Event::Move(call.triggers.get("ban")?))) }),
        )
        .unwrap()
        .on_send_gated(
            "register --> ban",
            SendGate::new([Action::Move], [ban]),
            OutboxNotice::new("ban", "goodbye"),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut rx = agent.events().subscribe();

    for peer in ["A", "B", "C"] {
        agent.store().push("ban", OutboxEntry::peer(peer)).await.unwrap();
    }
    agent.handle_envelope(envelope("Alice", None, "x")).await;

    let report = agent.run_gated_sends().await;
    assert_eq!(report.produced, 3);
    assert_eq!(report.failed, 3);
    assert_eq!(transport.attempts(), 3);
    assert_eq!(agent.store().pending("ban").await.unwrap(), 0);

    let failures = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, FlowEvent::SendFailed { .. }))
        .count();
    assert_eq!(failures, 3);

    agent.run_gated_sends().await;
    assert_eq!(transport.attempts(), 3);
}

// ---------------------------------------------------------------------------
// Listening gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listening_mode_ends_once_and_stays_ended() {
    let config = AgentConfig {
        start_listening: true,
        ..AgentConfig::new("Me")
    };
    let transport = Arc::new(RecordingTransport::new());
    let builder = FlowAgent::builder(config, handshake()).standard_hooks();
    let store = builder.store().clone();
    let go = builder.trigger("go").unwrap();
    let sync = ListeningGate::new(
        PeerStateSync::new(store.clone(), "relations", "register"),
        store.clone(),
        "listen",
    );
    let agent = builder
        .on_receive(
            "listen --> register",
            ControlGate::new("/travel", go),
        )
        .unwrap()
        .state_sync(sync)
        .initial_state("listen")
        .transport(transport)
        .build()
        .unwrap();
    let mut rx = agent.events().subscribe();

    // Ordinary traffic while listening dispatches under the listen state only.
    let report = agent.handle_envelope(envelope("Alice", None, "hi")).await;
    assert_eq!(report.snapshot, Some(StateSnapshot::Single("listen".into())));
    assert!(store.is_listening().await.unwrap());

    let token = || Envelope::new("x", json!("/travel"));
    let first = agent.handle_envelope(token()).await;
    assert_eq!(first.transitions().count(), 1);
    assert!(!store.is_listening().await.unwrap());

    let second = agent.handle_envelope(token()).await;
    assert!(!second.accepted);
    assert!(!store.is_listening().await.unwrap());

    let ended = drain_events(&mut rx)
        .into_iter()
        .filter(|e| *e == FlowEvent::ListeningEnded)
        .count();
    assert_eq!(ended, 1);

    // Peers are tracked normally afterwards.
    agent.handle_envelope(envelope("Alice", None, "hi")).await;
    assert_eq!(store.get("relations", "Alice").await.unwrap(), Some("register".into()));
}

// ---------------------------------------------------------------------------
// Route round-trip
// ---------------------------------------------------------------------------

#[test]
fn every_edge_round_trips_through_route_text() {
    let styles = [
        ArrowStyle::default(),
        ArrowStyle::new("=", ("(", ")"), "|", "}").unwrap(),
    ];
    for style in styles {
        let graph = FlowGraph::builder(style.clone())
            .edge("register", "contact", ["ok", "retry"])
            .edge("register", "ban", Vec::<String>::new())
            .edge("contact", "friend", ["ok"])
            .build()
            .unwrap();
        for edge in graph.edges() {
            let route = edge.route();
            let text = route.render(&style);
            assert_eq!(parse_route(&text, &style).unwrap(), route, "{text}");
            assert_eq!(graph.resolve(&text).unwrap(), route);
        }
    }
}

// ---------------------------------------------------------------------------
// Outbox entries follow the winning activation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refused_move_queues_nothing() {
    let transport = Arc::new(RecordingTransport::new());
    let builder = peer_agent(AgentConfig::new("Me"), transport.clone());
    let ok = builder.trigger("ok").unwrap();
    let ban = builder.trigger("ban").unwrap();
    let agent = builder
        .on_receive(
            "register --> ban",
            MatchRule::new(Matcher::Contains("meh".into()), Event::Move(ok)).with_outbox("ban"),
        )
        .unwrap()
        .on_send_gated(
            "register --> ban",
            SendGate::new([Action::Move], [ban]),
            OutboxNotice::new("ban", "goodbye"),
        )
        .unwrap()
        .build()
        .unwrap();

    let report = agent.handle_envelope(envelope("Alice", None, "meh")).await;
    assert_eq!(report.transitions().count(), 0);
    let view = agent.store().view("relations").await.unwrap();
    assert_eq!(view["Alice"], "register");
    assert_eq!(agent.store().pending("ban").await.unwrap(), 0);

    assert_eq!(agent.run_gated_sends().await.attempted(), 0);
    assert!(transport.sent().is_empty());
}

// ---------------------------------------------------------------------------
// Channel sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channels_move_independently_per_peer() {
    let graph = FlowGraph::builder(ArrowStyle::default())
        .route("register --[ ok ]--> contact")
        .route("neutral --[ like ]--> good")
        .build()
        .unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let builder = FlowAgent::builder(AgentConfig::new("Me"), graph).standard_hooks();
    let sync = ChannelStateSync::new(
        builder.store().clone(),
        vec![
            Channel::new("to_me", "register"),
            Channel::new("to_them", "neutral"),
        ],
    )
    .unwrap();
    let ok = builder.trigger("ok").unwrap();
    let like = builder.trigger("like").unwrap();
    let agent = builder
        .on_receive(
            "register --> contact",
            MatchRule::new(Matcher::Equals("hello".into()), Event::Move(ok)),
        )
        .unwrap()
        .on_receive(
            "neutral --> good",
            MatchRule::new(Matcher::Contains("gift".into()), Event::Move(like.clone()))
                .with_outbox("good"),
        )
        .unwrap()
        .on_send_gated(
            "neutral --> good",
            SendGate::new([Action::Move], [like]),
            OutboxNotice::new("good", "thanks for the gift"),
        )
        .unwrap()
        .state_sync(sync)
        .transport(transport.clone())
        .build()
        .unwrap();

    let report = agent.handle_envelope(envelope("Alice", None, "a gift")).await;
    assert_eq!(
        report.snapshot,
        Some(StateSnapshot::Namespaced(BTreeMap::from([
            ("to_me:Alice".to_string(), Node::from("register")),
            ("to_them:Alice".to_string(), Node::from("neutral")),
        ])))
    );
    let keys: Vec<&str> = report.decisions.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, ["to_me:Alice", "to_them:Alice"]);
    let moved: Vec<&str> = report.transitions().map(|d| d.key.as_str()).collect();
    assert_eq!(moved, ["to_them:Alice"]);

    assert_eq!(agent.store().view("to_me").await.unwrap()["Alice"], "register");
    assert_eq!(agent.store().view("to_them").await.unwrap()["Alice"], "good");

    let sent = agent.run_gated_sends().await;
    assert_eq!(sent.delivered, 1);
    let out = transport.sent();
    assert_eq!(out[0].to.as_deref(), Some("Alice"));
    assert_eq!(out[0].text(), "thanks for the gift");

    // The other channel still moves on its own trigger.
    let report = agent.handle_envelope(envelope("Alice", None, "hello")).await;
    let moved: Vec<&str> = report.transitions().map(|d| d.key.as_str()).collect();
    assert_eq!(moved, ["to_me:Alice"]);
    assert_eq!(agent.store().view("to_me").await.unwrap()["Alice"], "contact");
    assert_eq!(agent.store().view("to_them").await.unwrap()["Alice"], "good");
}

// ---------------------------------------------------------------------------
// Running agent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawned_agent_replies_through_channel_transport() {
    let (transport, mut outbound) = ChannelTransport::new();
    let builder = FlowAgent::builder(AgentConfig::new("Me"), handshake()).standard_hooks();
    let sync = PeerStateSync::new(builder.store().clone(), "relations", "register");
    let ok = builder.trigger("ok").unwrap();
    let agent = builder
        .on_receive(
            "register --> contact",
            MatchRule::new(Matcher::Equals("hello".into()), Event::Move(ok.clone()))
                .with_outbox("contact"),
        )
        .unwrap()
        .on_send_gated(
            "register --> contact",
            SendGate::new([Action::Move], [ok]),
            OutboxNotice::new("contact", "welcome"),
        )
        .unwrap()
        .state_sync(sync)
        .initial_state("register")
        .transport(Arc::new(transport))
        .build()
        .unwrap();

    let (inbound, rx) = tokio::sync::mpsc::channel(8);
    let handle = Arc::new(agent).spawn(rx);
    inbound.send(envelope("Alice", None, "hello")).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .expect("reply in time")
        .expect("channel open");
    assert_eq!(reply.from.as_deref(), Some("Me"));
    assert_eq!(reply.to.as_deref(), Some("Alice"));
    assert_eq!(reply.text(), "welcome");

    handle.shutdown().await;
}
