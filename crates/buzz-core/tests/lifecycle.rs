//! # Lifecycle Tests
//!
//! End-to-end tests for the connection manager driving sessions over the
//! in-memory transport.

use mqttbuzz_core::{
    ConnectionManager, EndpointId, EndpointSpec, EventStream, FilterPolicy, SessionEvent,
    SessionSettings, SessionState, ToggleOutcome,
};
use mqttbuzz_transport::MemoryTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(300);

fn setup(settings: SessionSettings) -> (Arc<ConnectionManager>, EventStream, MemoryTransport) {
    let transport = MemoryTransport::new();
    let (manager, events) = ConnectionManager::new(Arc::new(transport.clone()), settings);
    (Arc::new(manager), events, transport)
}

async fn next_event(events: &mut EventStream) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Everything already emitted, without waiting.
fn drain(events: &mut EventStream) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Let spawned sessions process whatever is queued for them.
async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

fn forwarded_body(event: SessionEvent) -> String {
    match event {
        SessionEvent::MessageForwarded { body, .. } => body,
        other => panic!("expected a forwarded message, got {other:?}"),
    }
}

// ============================================================================
// Start / stop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_unreachable_one_reachable() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    transport.refuse("offline", 1883, "connection refused");

    let report = manager
        .start_all(vec![
            EndpointSpec::new("offline", 1883, "t"),
            EndpointSpec::new("online", 1883, "t"),
        ])
        .await;
    assert_eq!(report.started.len(), 2);

    let mut seen = vec![next_event(&mut events).await, next_event(&mut events).await];
    seen.sort_by(|a, b| a.endpoint().cmp(b.endpoint()));

    assert!(matches!(
        &seen[0],
        SessionEvent::ConnectFailed { header, error, .. }
            if header == "offline" && error.contains("connection refused")
    ));
    assert!(matches!(&seen[1], SessionEvent::Connected { header, .. } if header == "online"));

    settle().await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_waits_for_every_session() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    let specs: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|host| EndpointSpec::new(*host, 1883, "t"))
        .collect();

    manager.start_all(specs).await;
    for _ in 0..3 {
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));
    }

    let report = manager.stop_all().await;
    assert_eq!(report.disconnected.len(), 3);
    assert!(!manager.is_live());

    // Every Disconnected is already on the stream when stop_all returns.
    let disconnected = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Disconnected { reason: None, .. }))
        .count();
    assert_eq!(disconnected, 3);
    for host in ["a", "b", "c"] {
        assert_eq!(transport.connection_count(host, 1883), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_force_releases_stalled_sessions() {
    let settings = SessionSettings::new().with_stop_timeout(Duration::from_secs(2));
    let (manager, mut events, transport) = setup(settings);

    manager
        .start_all(vec![
            EndpointSpec::new("a", 1883, "t"),
            EndpointSpec::new("b", 1883, "t"),
        ])
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    transport.set_stall_close(true);
    let report = manager.stop_all().await;

    assert_eq!(report.force_released.len(), 2);
    assert!(report.disconnected.is_empty());
    let reasons: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Disconnected { reason, .. } => reason,
            _ => None,
        })
        .collect();
    assert_eq!(reasons.len(), 2);
    assert_eq!(transport.connection_count("a", 1883), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_endpoint_is_stopped_silently() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    transport.refuse("offline", 1883, "refused");

    manager
        .start_all(vec![EndpointSpec::new("offline", 1883, "t")])
        .await;
    assert!(matches!(next_event(&mut events).await, SessionEvent::ConnectFailed { .. }));
    settle().await;

    // Still part of the live set, but idle.
    assert!(manager.is_live());
    assert_eq!(
        manager.session_states(),
        vec![(EndpointId::new("offline", 1883, "t"), SessionState::Idle)]
    );

    let report = manager.stop_all().await;
    assert_eq!(report.already_idle.len(), 1);
    assert!(drain(&mut events).is_empty());
}

// ============================================================================
// Reconnect / toggle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_all_never_overlaps_sessions() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    let spec = EndpointSpec::new("broker", 1883, "alerts").with_header("Alerts");

    manager.start_all(vec![spec.clone()]).await;
    next_event(&mut events).await;

    for round in 0..3 {
        let renamed = spec.clone().with_subheader(format!("round {round}"));
        let report = manager
            .reconnect_all(vec![renamed, EndpointSpec::new("other", 1883, "x")])
            .await;
        assert_eq!(report.started.started.len(), 2);
        assert_eq!(report.stopped.total(), if round == 0 { 1 } else { 2 });

        settle().await;
        assert_eq!(transport.subscriber_count("broker", 1883, "alerts"), 1);
    }
    settle().await;

    // No two Connected events for one header without a Disconnected between.
    let mut connected: HashMap<String, bool> = HashMap::new();
    for event in drain(&mut events) {
        match event {
            SessionEvent::Connected { header, .. } => {
                let was_connected = connected.insert(header.clone(), true).unwrap_or(false);
                assert!(!was_connected, "{header} connected twice");
            }
            SessionEvent::Disconnected { header, .. } => {
                connected.insert(header, false);
            }
            _ => {}
        }
    }

    // A message is delivered exactly once.
    transport.publish("broker", 1883, "alerts", "fire");
    assert_eq!(forwarded_body(next_event(&mut events).await), "fire");
    settle().await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_all_drops_removed_endpoints() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    manager
        .start_all(vec![
            EndpointSpec::new("a", 1883, "t"),
            EndpointSpec::new("b", 1883, "t"),
        ])
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    manager
        .reconnect_all(vec![
            EndpointSpec::new("a", 1883, "t"),
            EndpointSpec::new("b", 1883, "t").with_enabled(false),
        ])
        .await;
    settle().await;

    assert_eq!(transport.connection_count("a", 1883), 1);
    assert_eq!(transport.connection_count("b", 1883), 0);
    assert_eq!(manager.live_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_switches_between_stopped_and_started() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    manager
        .start_all(vec![EndpointSpec::new("broker", 1883, "t")])
        .await;
    next_event(&mut events).await;

    assert!(matches!(manager.toggle().await, ToggleOutcome::Stopped(r) if r.disconnected.len() == 1));
    assert!(!manager.is_live());
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected { .. }
    ));

    assert!(matches!(manager.toggle().await, ToggleOutcome::Started(r) if r.started.len() == 1));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected { .. }));
    assert_eq!(transport.total_connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_toggles_serialize() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    manager
        .start_all(vec![EndpointSpec::new("broker", 1883, "t")])
        .await;
    next_event(&mut events).await;

    let first = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.toggle().await }
    });
    let second = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.toggle().await }
    });
    let outcomes = [first.await.unwrap(), second.await.unwrap()];

    let stopped = outcomes
        .iter()
        .filter(|o| matches!(o, ToggleOutcome::Stopped(_)))
        .count();
    assert_eq!(stopped, 1);
    settle().await;
    assert_eq!(transport.subscriber_count("broker", 1883, "t"), 1);
}

// ============================================================================
// Filtering and delivery through the manager
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_dedup_scenario() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    let spec = EndpointSpec::new("broker", 1883, "t")
        .with_filter(FilterPolicy::dedup(Duration::from_secs(5)));
    manager.start_all(vec![spec]).await;
    next_event(&mut events).await;

    // t=0
    transport.publish("broker", 1883, "t", "A");
    assert_eq!(forwarded_body(next_event(&mut events).await), "A");

    // t=2
    tokio::time::advance(Duration::from_secs(2)).await;
    transport.publish("broker", 1883, "t", "A");
    settle().await;
    assert!(drain(&mut events).is_empty());

    // t=6
    tokio::time::advance(Duration::from_secs(4)).await;
    transport.publish("broker", 1883, "t", "A");
    assert_eq!(forwarded_body(next_event(&mut events).await), "A");
    settle().await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_throttle_scenario() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    let spec = EndpointSpec::new("broker", 1883, "t")
        .with_filter(FilterPolicy::throttle(Duration::from_secs(10)));
    manager.start_all(vec![spec]).await;
    next_event(&mut events).await;

    transport.publish("broker", 1883, "t", "A");
    assert_eq!(forwarded_body(next_event(&mut events).await), "A");

    tokio::time::advance(Duration::from_secs(3)).await;
    transport.publish("broker", 1883, "t", "B");
    settle().await;

    tokio::time::advance(Duration::from_secs(8)).await;
    transport.publish("broker", 1883, "t", "C");
    assert_eq!(forwarded_body(next_event(&mut events).await), "C");
    settle().await;
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_filter_state_is_per_endpoint() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    let throttle = FilterPolicy::throttle(Duration::from_secs(60));
    manager
        .start_all(vec![
            EndpointSpec::new("a", 1883, "t").with_filter(throttle),
            EndpointSpec::new("b", 1883, "t").with_filter(throttle),
        ])
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    transport.publish("a", 1883, "t", "same");
    assert_eq!(forwarded_body(next_event(&mut events).await), "same");
    transport.publish("b", 1883, "t", "same");
    assert_eq!(forwarded_body(next_event(&mut events).await), "same");
}

#[tokio::test(start_paused = true)]
async fn test_max_message_length_applies() {
    let settings = SessionSettings::new().with_max_message_length(256);
    let (manager, mut events, transport) = setup(settings);
    manager
        .start_all(vec![EndpointSpec::new("broker", 1883, "t").with_sound(false)])
        .await;
    next_event(&mut events).await;

    let body: String = ('a'..='z').cycle().take(300).collect();
    transport.publish("broker", 1883, "t", body.clone());

    match next_event(&mut events).await {
        SessionEvent::MessageForwarded {
            body: forwarded,
            sound_enabled,
            ..
        } => {
            assert_eq!(forwarded, body[..256]);
            assert!(!sound_enabled);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropped_endpoint_does_not_affect_others() {
    let (manager, mut events, transport) = setup(SessionSettings::new());
    manager
        .start_all(vec![
            EndpointSpec::new("flaky", 1883, "t"),
            EndpointSpec::new("steady", 1883, "t"),
        ])
        .await;
    next_event(&mut events).await;
    next_event(&mut events).await;

    transport.drop_connections("flaky", 1883, Some("network unreachable"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected { header, reason: Some(_), .. } if header == "flaky"
    ));

    transport.publish("steady", 1883, "t", "still here");
    assert_eq!(forwarded_body(next_event(&mut events).await), "still here");

    let stats = manager.stats();
    assert_eq!(stats.connected, 1);
    assert_eq!(stats.idle, 1);
}
