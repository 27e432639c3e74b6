//! End-to-end behavior checks for the realtime core.
//!
//! Each test drives a `RealtimeClient` against the in-memory peer:
//! - channel name uniqueness under repeated creation
//! - cleanup after the last unsubscribe
//! - callback panic isolation
//! - event-type filtering
//! - backoff growth and the retry budget
//! - subscription fidelity across reconnection
//! - the single-table subscribe/receive/unsubscribe flow
//! - offline/online transitions and transport loss

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::client::{RealtimeClient, SubscribeOptions};
use crate::config::RealtimeConfig;
use crate::models::{
    ChangeEvent, ChannelStatus, ConnectionStatus, EventSelector, ReconnectState, TableSubscription,
};
use crate::transport::{HandshakeScript, InMemoryTransport};

fn client_with(transport: &InMemoryTransport, config: RealtimeConfig) -> RealtimeClient {
    RealtimeClient::new(Arc::new(transport.clone()), config).unwrap()
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

fn counting() -> (Arc<AtomicUsize>, impl Fn(&ChangeEvent) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = hits.clone();
    (hits, move |_: &ChangeEvent| {
        sink.fetch_add(1, Ordering::SeqCst);
    })
}

// =========================================================================
// Channel names are unique
// =========================================================================

#[tokio::test]
async fn test_recreating_a_name_replaces_never_duplicates() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());

    for table in ["orders", "users", "orders", "invoices"] {
        client
            .create_multi_table_channel("panel", vec![TableSubscription::new(table, EventSelector::Any)])
            .await
            .unwrap();
        assert_eq!(client.channel_names(), vec!["panel".to_string()]);
        assert_eq!(transport.subscribed_channels(), vec!["panel".to_string()]);
    }

    assert_eq!(transport.handshake_count("panel"), 4);
    assert_eq!(
        client.channel_subscriptions("panel"),
        Some(vec![TableSubscription::new("invoices", EventSelector::Any)])
    );
}

#[tokio::test]
async fn test_concurrent_subscribes_open_one_channel() {
    let transport = InMemoryTransport::new();
    transport.set_default_handshake(HandshakeScript::Hold);
    let client = client_with(&transport, RealtimeConfig::default());

    let subs: Vec<_> = (0..5).map(|_| client.on_insert("orders", |_| {})).collect();
    eventually(|| transport.handshake_count("public:orders:INSERT") == 1).await;
    transport.complete_handshake("public:orders:INSERT", ChannelStatus::Subscribed);
    eventually(|| client.channel_count() == 1).await;

    assert_eq!(transport.opened_channels(), vec!["public:orders:INSERT".to_string()]);
    assert_eq!(client.registration_count(), subs.len());
}

// =========================================================================
// The last unsubscribe removes the channel
// =========================================================================

#[tokio::test]
async fn test_cleanup_after_last_unsubscribe() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());

    let mut subs = vec![
        client.on_insert("orders", |_| {}),
        client.on_all("users", |_| {}),
        client.on_insert("orders", |_| {}),
        client.on_delete("users", |_| {}),
        client.on_all("users", |_| {}),
    ];
    eventually(|| client.channel_count() == 3).await;

    // Unsubscribe in an order that interleaves channels.
    for index in [2, 0, 4, 3, 1] {
        let sub = subs.remove(index.min(subs.len() - 1));
        let channel = sub.channel_name().to_string();
        assert!(sub.unsubscribe());
        let still_used = subs.iter().any(|other| other.channel_name() == channel);
        assert_eq!(client.channel_names().contains(&channel), still_used, "channel {channel}");
    }

    assert!(subs.is_empty());
    assert_eq!(client.channel_count(), 0);
    assert_eq!(client.registration_count(), 0);
    eventually(|| transport.subscribed_channels().is_empty()).await;
}

// =========================================================================
// A panicking callback does not affect its siblings
// =========================================================================

#[tokio::test]
async fn test_panicking_callback_is_isolated() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let (hits, healthy) = counting();

    let _bad = client.on_insert("orders", |_| panic!("callback bug"));
    let _good = client.on_insert("orders", healthy);
    eventually(|| client.channel_count() == 1).await;

    transport.emit(&ChangeEvent::insert("orders", json!({"id": 1})));
    transport.emit_to("public:orders:INSERT", &ChangeEvent::insert("orders", json!({"id": 2})));

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(client.delivered_callback_count(), 2);
    assert_eq!(client.failed_callback_count(), 2);
    assert_eq!(client.channel_count(), 1);
}

// =========================================================================
// Event-type filtering
// =========================================================================

#[tokio::test]
async fn test_insert_registration_ignores_update_and_delete() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let (insert_hits, on_insert) = counting();
    let (any_hits, on_any) = counting();

    let _inserts = client.on_insert("orders", on_insert);
    let _all = client.on_all("orders", on_any);
    eventually(|| client.channel_count() == 2).await;

    transport.emit(&ChangeEvent::insert("orders", json!({"id": 1})));
    transport.emit(&ChangeEvent::update("orders", json!({"id": 1, "v": 2}), json!({"id": 1})));
    transport.emit(&ChangeEvent::delete("orders", json!({"id": 1})));

    assert_eq!(insert_hits.load(Ordering::SeqCst), 1);
    assert_eq!(any_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shared_channel_filters_per_registration() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    client
        .create_multi_table_channel("feed", vec![TableSubscription::new("orders", EventSelector::Any)])
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for event in [EventSelector::Insert, EventSelector::Update, EventSelector::Any] {
        let seen = seen.clone();
        subs.push(client.subscribe(
            SubscribeOptions::new("orders").event(event).channel("feed"),
            move |change: &ChangeEvent| seen.lock().push((event, change.event_type)),
        ));
    }

    transport.emit(&ChangeEvent::update("orders", json!({"id": 1}), json!({"id": 1})));

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(_, kind)| EventSelector::Update.accepts(*kind)));
    assert!(!seen.iter().any(|(selector, _)| *selector == EventSelector::Insert));
}

// =========================================================================
// Backoff grows and the retry budget is enforced
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_and_halts_after_budget() {
    let transport = InMemoryTransport::new();
    let config = RealtimeConfig::default()
        .with_max_reconnect_attempts(4)
        .with_backoff(Duration::from_millis(100), Duration::from_millis(250));
    let client = client_with(&transport, config);
    let channel = "public:orders:INSERT";

    let _sub = client.on_insert("orders", |_| {});
    eventually(|| client.channel_count() == 1).await;
    assert_eq!(transport.handshake_count(channel), 1);

    transport.set_default_handshake(HandshakeScript::Reject("peer unavailable".into()));
    client.reconnect().unwrap();

    let mut attempt_times = Vec::new();
    let mut last_count = 1;
    while !client.reconnect_state().is_failed() {
        let count = transport.handshake_count(channel);
        if count > last_count {
            attempt_times.push(Instant::now());
            last_count = count;
        }
        assert!(client.reconnect_attempts() <= 4);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    if transport.handshake_count(channel) > last_count {
        attempt_times.push(Instant::now());
    }

    assert_eq!(attempt_times.len(), 4);
    let gaps: Vec<Duration> = attempt_times.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert!(gaps.windows(2).all(|pair| pair[1] >= pair[0]), "gaps {gaps:?}");
    // Sampled every 5ms, so each gap is exact to within one poll.
    assert!(gaps[0] >= Duration::from_millis(95));
    assert!(gaps[1] >= Duration::from_millis(195));
    assert!(gaps[2] >= Duration::from_millis(245) && gaps[2] <= Duration::from_millis(255));

    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(client.reconnect_attempts(), 4);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.handshake_count(channel), 5);
    assert_eq!(client.reconnect_state(), ReconnectState::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_state_needs_explicit_reconnect() {
    let transport = InMemoryTransport::new();
    let config = RealtimeConfig::default()
        .with_max_reconnect_attempts(2)
        .with_backoff(Duration::from_millis(10), Duration::from_millis(10));
    let client = client_with(&transport, config);
    let channel = "public:orders:*";

    let _sub = client.on_all("orders", |_| {});
    eventually(|| client.channel_count() == 1).await;
    transport.set_default_handshake(HandshakeScript::Reject("down".into()));
    client.reconnect().unwrap();
    while !client.reconnect_state().is_failed() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let after_failure = transport.handshake_count(channel);

    transport.set_default_handshake(HandshakeScript::Accept);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.handshake_count(channel), after_failure);

    client.reconnect().unwrap();
    let mut status = client.watch_status();
    while !status.borrow_and_update().is_connected() {
        status.changed().await.unwrap();
    }
    assert_eq!(client.reconnect_state(), ReconnectState::Idle);
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(client.channel_names(), vec![channel.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_hung_handshake_counts_against_budget() {
    let transport = InMemoryTransport::new();
    let config = RealtimeConfig::default()
        .with_max_reconnect_attempts(2)
        .with_backoff(Duration::from_millis(50), Duration::from_millis(50))
        .with_handshake_timeout(Some(Duration::from_secs(1)));
    let client = client_with(&transport, config);

    let _sub = client.on_insert("orders", |_| {});
    eventually(|| client.channel_count() == 1).await;
    transport.set_default_handshake(HandshakeScript::Hold);
    client.reconnect().unwrap();

    while !client.reconnect_state().is_failed() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(transport.handshake_count("public:orders:INSERT"), 3);
    assert_eq!(client.channel_count(), 0);
}

// =========================================================================
// Reconnection restores what callers subscribed to
// =========================================================================

#[tokio::test]
async fn test_reconnect_restores_channels_and_callbacks() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let (a_hits, on_a) = counting();
    let (b_hits, on_b) = counting();

    let _a = client.subscribe(SubscribeOptions::new("t1").event(EventSelector::Insert).channel("A"), on_a);
    let _b = client.subscribe(SubscribeOptions::new("t2").channel("B"), on_b);
    eventually(|| client.channel_count() == 2 && client.connection_status().is_connected()).await;

    transport.drop_all(ChannelStatus::ChannelError("socket closed".into()));
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    eventually(|| client.connection_status().is_connected() && client.channel_count() == 2).await;

    assert_eq!(client.reconnect_state(), ReconnectState::Idle);
    assert_eq!(client.channel_names(), vec!["A".to_string(), "B".to_string()]);
    assert_eq!(
        client.channel_subscriptions("A"),
        Some(vec![TableSubscription::new("t1", EventSelector::Insert)])
    );
    assert_eq!(
        client.channel_subscriptions("B"),
        Some(vec![TableSubscription::new("t2", EventSelector::Any)])
    );
    assert_eq!(transport.handshake_count("A"), 2);
    assert_eq!(transport.handshake_count("B"), 2);

    transport.emit(&ChangeEvent::insert("t1", json!({"id": 1})));
    transport.emit(&ChangeEvent::delete("t2", json!({"id": 2})));
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnect_restores_declared_tables() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let tables = vec![
        TableSubscription::new("orders", EventSelector::Any),
        TableSubscription::new("users", EventSelector::Update),
    ];
    client.create_multi_table_channel("dashboard", tables.clone()).await.unwrap();

    client.reconnect().unwrap();
    eventually(|| transport.handshake_count("dashboard") == 2 && client.channel_count() == 1).await;

    assert_eq!(client.channel_subscriptions("dashboard"), Some(tables));
}

#[tokio::test]
async fn test_subscribe_during_reconnect_is_kept() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let _orders = client.on_insert("orders", |_| {});
    eventually(|| client.channel_count() == 1).await;

    transport.set_handshake("public:orders:INSERT", HandshakeScript::Hold);
    client.reconnect().unwrap();
    eventually(|| transport.handshake_count("public:orders:INSERT") == 2).await;

    let (hits, on_user) = counting();
    let _users = client.on_insert("users", on_user);
    eventually(|| client.channel_names().contains(&"public:users:INSERT".to_string())).await;

    transport.complete_handshake("public:orders:INSERT", ChannelStatus::Subscribed);
    eventually(|| client.connection_status().is_connected() && client.channel_count() == 2).await;

    transport.emit(&ChangeEvent::insert("users", json!({"id": 3})));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

// =========================================================================
// Single-table subscribe, receive, unsubscribe
// =========================================================================

#[tokio::test]
async fn test_orders_insert_flow() {
    let transport = InMemoryTransport::new();
    transport.set_default_handshake(HandshakeScript::Hold);
    let client = client_with(&transport, RealtimeConfig::default());
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let sub = client.subscribe(
        SubscribeOptions::new("orders").event(EventSelector::Insert),
        move |event: &ChangeEvent| sink.lock().push(event.clone()),
    );
    eventually(|| transport.handshake_count(sub.channel_name()) == 1).await;
    assert_eq!(client.channel_count(), 0);

    transport.complete_handshake(sub.channel_name(), ChannelStatus::Subscribed);
    eventually(|| client.channel_count() == 1).await;

    let event = ChangeEvent::insert("orders", json!({"id": 1}));
    transport.emit(&event);

    {
        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], event);
        assert_eq!(received[0].new, Some(json!({"id": 1})));
    }

    assert!(sub.unsubscribe());
    assert_eq!(client.channel_count(), 0);
}

// =========================================================================
// Connectivity signals and transport loss
// =========================================================================

#[tokio::test]
async fn test_offline_then_online_rebuilds() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let (signals_tx, signals_rx) = tokio::sync::mpsc::channel(4);
    client.attach_network_signals(signals_rx);

    let _sub = client.on_update("orders", |_| {});
    eventually(|| client.connection_status().is_connected()).await;

    signals_tx.send(crate::services::NetworkSignal::Offline).await.unwrap();
    eventually(|| client.connection_status().is_disconnected()).await;
    assert_eq!(client.reconnect_state(), ReconnectState::Idle);

    signals_tx.send(crate::services::NetworkSignal::Online).await.unwrap();
    eventually(|| client.connection_status().is_connected()).await;
    assert_eq!(transport.handshake_count("public:orders:UPDATE"), 2);
}

#[tokio::test]
async fn test_handshake_landing_after_offline_stays_disconnected() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let name = "public:orders:UPDATE";
    let _sub = client.on_update("orders", |_| {});
    eventually(|| client.connection_status().is_connected()).await;

    transport.set_handshake(name, HandshakeScript::Hold);
    client.reconnect().unwrap();
    eventually(|| transport.handshake_count(name) == 2).await;

    client.notify_offline();
    transport.complete_handshake(name, ChannelStatus::Subscribed);
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(client.reconnect_state(), ReconnectState::Idle);

    transport.clear_handshake(name);
    client.notify_online();
    eventually(|| client.connection_status().is_connected()).await;
    assert_eq!(transport.handshake_count(name), 3);
}

#[tokio::test]
async fn test_online_while_connected_does_nothing() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default());
    let _sub = client.on_update("orders", |_| {});
    eventually(|| client.connection_status().is_connected()).await;

    client.notify_online();
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(transport.total_handshakes(), 1);
    assert_eq!(client.reconnect_state(), ReconnectState::Idle);
}

#[tokio::test]
async fn test_transport_loss_without_auto_reconnect_stays_down() {
    let transport = InMemoryTransport::new();
    let client = client_with(&transport, RealtimeConfig::default().with_auto_reconnect(false));
    let _sub = client.on_all("orders", |_| {});
    eventually(|| client.connection_status().is_connected()).await;

    transport.drop_all(ChannelStatus::Closed);
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);
    assert_eq!(transport.total_handshakes(), 1);

    client.reconnect().unwrap();
    eventually(|| client.connection_status().is_connected()).await;
    assert_eq!(transport.total_handshakes(), 2);
}
