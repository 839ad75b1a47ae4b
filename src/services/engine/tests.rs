//! Tests for the timing engine
//!
//! All tests run on a paused clock so elapsed times are exact.

use super::*;
use crate::domain::types::{DistancePreset, TimingState};
use crate::services::dispatcher::NotifierConfig;
use tokio::time::advance;

/// Test harness that keeps channel receivers alive so `try_send` succeeds
struct TestEngine {
    engine: TimingEngine,
    handle: EngineHandle,
    events: broadcast::Receiver<EngineEvent>,
    notify_rx: mpsc::Receiver<NotifyRequest>,
    metrics: Arc<Metrics>,
}

fn settings(auto_reset: bool) -> EngineSettings {
    EngineSettings { auto_reset, ..EngineSettings::default() }
}

fn create_test_engine(settings: EngineSettings) -> TestEngine {
    let metrics = Arc::new(Metrics::new());
    let (events_tx, events) = broadcast::channel(256);
    let (notify_tx, notify_rx) = mpsc::channel(8);
    let (handle, engine) = create_engine(
        settings,
        metrics.clone(),
        NotifierConfig::default().shared(),
        Some(notify_tx),
        events_tx,
        64,
    );
    TestEngine { engine, handle, events, notify_rx, metrics }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

const START: [u8; 2] = [0x05, 0x01];
const END: [u8; 2] = [0x81, 0x01];

/// Everything published so far, ticks excluded
fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, EngineEvent::Tick(_)) {
            out.push(event);
        }
    }
    out
}

fn completed(events: &[EngineEvent]) -> Vec<&SprintRecord> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::SprintCompleted { record, .. } => Some(record),
            _ => None,
        })
        .collect()
}

fn has_report(events: &[EngineEvent], expected: &EngineReport) -> bool {
    events.iter().any(|e| matches!(e, EngineEvent::Report(r) if r == expected))
}

/// Wait for the next non-tick event from a running engine
async fn next_event(events: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Tick(_)) => continue,
            Ok(event) => return event,
            Err(e) => panic!("event stream failed: {e}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_twenty_metre_sprint() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&START);
    assert!(t.engine.session().is_timing());
    advance(millis(2857)).await;
    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    let records = completed(&events);
    assert_eq!(records.len(), 1);
    assert!((records[0].elapsed_seconds - 2.857).abs() < 1e-9);
    assert!((records[0].speed_kmh - 25.2).abs() < 0.01);
    assert_eq!(records[0].distance_meters, 20.0);

    let Some(EngineEvent::SprintCompleted { outcome, snapshot, .. }) =
        events.iter().find(|e| matches!(e, EngineEvent::SprintCompleted { .. }))
    else {
        panic!("no sprint event");
    };
    assert!(outcome.session_record_broken);
    assert!(outcome.lifetime_record_broken);
    assert_eq!(snapshot.history.len(), 1);

    assert_eq!(t.engine.session(), TimingSession::idle());
    assert_eq!(t.handle.session(), TimingSession::idle());
    assert_eq!(t.metrics.sprints_completed(), 1);

    let request = t.notify_rx.try_recv().unwrap();
    assert!((request.record.elapsed_seconds - 2.857).abs() < 1e-9);
    assert!(request.outcome.lifetime_record_broken);
}

#[tokio::test(start_paused = true)]
async fn test_forty_metre_preset() {
    let mut t = create_test_engine(EngineSettings {
        distance: Distance::Preset(DistancePreset::Forty),
        ..settings(true)
    });

    t.engine.handle_start("manual");
    advance(millis(5000)).await;
    t.engine.handle_end("manual");

    let events = drain(&mut t.events);
    let records = completed(&events);
    assert!((records[0].speed_kmh - 28.8).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_end_while_idle_is_noop() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    assert!(completed(&events).is_empty());
    assert!(has_report(&events, &EngineReport::Timing(TimingError::NoSessionActive)));
    assert_eq!(t.engine.session(), TimingSession::idle());
    assert_eq!(t.engine.stats.history_len(), 0);
    assert!(t.notify_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_start_while_timing_without_auto_reset() {
    let mut t = create_test_engine(settings(false));

    t.engine.handle_payload(&START);
    let first_start = t.engine.session().start_instant;
    advance(millis(1200)).await;
    t.engine.handle_payload(&START);

    assert_eq!(t.engine.session().start_instant, first_start);
    assert_eq!(t.engine.session().state, TimingState::Timing);
    assert!(has_report(&drain(&mut t.events), &EngineReport::StartIgnored));

    advance(millis(800)).await;
    t.engine.handle_payload(&END);
    let records_events = drain(&mut t.events);
    let records = completed(&records_events);
    assert!((records[0].elapsed_seconds - 2.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_timing_with_auto_reset() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&START);
    advance(millis(4000)).await;
    t.engine.handle_payload(&START);

    let events = drain(&mut t.events);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::SessionAborted)));
    assert!(completed(&events).is_empty());

    advance(millis(3000)).await;
    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    let records = completed(&events);
    assert_eq!(records.len(), 1);
    assert!((records[0].elapsed_seconds - 3.0).abs() < 1e-9);
    assert_eq!(t.metrics.report().sessions_aborted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_manual_start_follows_auto_reset_policy() {
    let mut t = create_test_engine(settings(false));

    t.engine.handle_command(EngineCommand::StartManually);
    let first_start = t.engine.session().start_instant;
    advance(millis(500)).await;
    t.engine.handle_command(EngineCommand::StartManually);

    assert_eq!(t.engine.session().start_instant, first_start);
    assert!(has_report(&drain(&mut t.events), &EngineReport::StartIgnored));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_custom_distance_consumes_session() {
    let mut t = create_test_engine(EngineSettings {
        distance: Distance::Custom("abc".to_string()),
        ..settings(true)
    });

    t.engine.handle_payload(&START);
    advance(millis(3000)).await;
    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    assert!(completed(&events).is_empty());
    assert!(has_report(
        &events,
        &EngineReport::Timing(TimingError::InvalidDistance("abc".to_string()))
    ));
    assert_eq!(t.engine.session(), TimingSession::idle());
    assert_eq!(t.engine.stats.history_len(), 0);
    assert_eq!(t.engine.stats.snapshot().all_time_top_speed, 0.0);
    assert!(t.engine.ready_deadline.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_custom_distance_set_at_runtime() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_command(EngineCommand::SetDistance(Distance::from_input("30")));
    t.engine.handle_payload(&START);
    advance(millis(4000)).await;
    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    let records = completed(&events);
    assert_eq!(records[0].distance_meters, 30.0);
    assert!((records[0].speed_kmh - 27.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_zero_elapsed_rejected_and_still_timing() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&START);
    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    assert!(has_report(&events, &EngineReport::Timing(TimingError::InvalidElapsed)));
    assert!(t.engine.session().is_timing());

    advance(millis(2500)).await;
    t.engine.handle_payload(&END);
    assert_eq!(completed(&drain(&mut t.events)).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_discards_session() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&START);
    advance(millis(1500)).await;
    t.engine.handle_command(EngineCommand::Reset);
    t.engine.handle_payload(&END);

    let events = drain(&mut t.events);
    assert!(completed(&events).is_empty());
    assert!(events.iter().any(|e| matches!(e, EngineEvent::SessionAborted)));
    assert_eq!(t.engine.session(), TimingSession::idle());
    assert!(t.notify_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_foreign_lane_ignored() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&[0x05, 0x02]);
    assert!(!t.engine.session().is_timing());
    assert_eq!(t.metrics.report().foreign_lane_filtered, 1);

    t.engine.handle_command(EngineCommand::SetLane(Lane(2)));
    t.engine.handle_payload(&[0x05, 0x02]);
    assert!(t.engine.session().is_timing());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_empty_payloads() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&[]);
    t.engine.handle_payload(&[0x42, 0x01]);

    assert!(!t.engine.session().is_timing());
    assert_eq!(t.metrics.report().events_unknown, 2);
    assert!(drain(&mut t.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clear_session_keeps_lifetime() {
    let mut t = create_test_engine(settings(true));

    t.engine.handle_payload(&START);
    advance(millis(2000)).await;
    t.engine.handle_payload(&END);
    t.engine.handle_command(EngineCommand::ClearSession);

    let snapshot = t.engine.stats.snapshot();
    assert!(snapshot.history.is_empty());
    assert_eq!(snapshot.session_top_speed, 0.0);
    assert!((snapshot.all_time_top_speed - 36.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_full_notify_queue_reports_drop() {
    let metrics = Arc::new(Metrics::new());
    let (events_tx, mut events) = broadcast::channel(256);
    let (notify_tx, _notify_rx) = mpsc::channel(1);
    let (_handle, mut engine) = create_engine(
        settings(true),
        metrics.clone(),
        NotifierConfig::default().shared(),
        Some(notify_tx),
        events_tx,
        8,
    );

    for _ in 0..2 {
        engine.handle_payload(&START);
        advance(millis(2000)).await;
        engine.handle_payload(&END);
    }

    assert!(has_report(&drain(&mut events), &EngineReport::NotificationDropped));
    assert_eq!(metrics.report().notifications_dropped, 1);
    assert_eq!(metrics.sprints_completed(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_actor_ready_after_cooldown() {
    let TestEngine { engine, handle, mut events, notify_rx: _notify_rx, .. } =
        create_test_engine(settings(true));
    tokio::spawn(engine.run());

    handle.deliver(Bytes::from_static(&START));
    assert!(matches!(next_event(&mut events).await, EngineEvent::SessionStarted));
    advance(millis(2857)).await;
    handle.deliver(Bytes::from_static(&END));

    let EngineEvent::SprintCompleted { record, .. } = next_event(&mut events).await else {
        panic!("expected sprint");
    };
    assert!((record.elapsed_seconds - 2.857).abs() < 0.011);

    let before_ready = Instant::now();
    assert!(matches!(next_event(&mut events).await, EngineEvent::Ready));
    assert!(Instant::now().duration_since(before_ready) >= READY_COOLDOWN - millis(1));
}

#[tokio::test(start_paused = true)]
async fn test_actor_reset_cancels_ready() {
    let TestEngine { engine, handle, mut events, notify_rx: _notify_rx, .. } =
        create_test_engine(settings(true));
    tokio::spawn(engine.run());

    handle.start_manually().await.unwrap();
    assert!(matches!(next_event(&mut events).await, EngineEvent::SessionStarted));
    advance(millis(1000)).await;
    handle.end_manually().await.unwrap();
    handle.reset().await.unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.history.len(), 1);

    advance(READY_COOLDOWN + millis(100)).await;
    tokio::task::yield_now().await;
    let events = drain(&mut events);
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Ready)));
}

#[tokio::test(start_paused = true)]
async fn test_actor_ticks_only_while_timing() {
    let TestEngine { engine, handle, mut events, notify_rx: _notify_rx, .. } =
        create_test_engine(settings(true));
    tokio::spawn(engine.run());

    handle.start_manually().await.unwrap();
    assert!(matches!(next_event(&mut events).await, EngineEvent::SessionStarted));
    advance(millis(10)).await;
    let tick = loop {
        if let EngineEvent::Tick(elapsed) = events.recv().await.unwrap() {
            break elapsed;
        }
    };
    assert!(tick >= millis(10));

    handle.end_manually().await.unwrap();
    assert!(matches!(next_event(&mut events).await, EngineEvent::SprintCompleted { .. }));

    advance(millis(100)).await;
    tokio::task::yield_now().await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, EngineEvent::Tick(_)), "tick after session ended");
    }
}

#[tokio::test]
async fn test_commands_fail_when_engine_gone() {
    let TestEngine { engine, handle, .. } = create_test_engine(settings(true));
    drop(engine);
    assert_eq!(handle.start_manually().await, Err(EngineError::Closed));
    assert_eq!(handle.snapshot().await.unwrap_err(), EngineError::Closed);
}

#[tokio::test]
async fn test_notification_toggles_shared_config() {
    let t = create_test_engine(settings(true));
    assert!(!t.handle.notifications_enabled());
    t.handle.set_notifications_enabled(true);
    assert!(t.handle.notifications_enabled());
}

#[tokio::test]
async fn test_enabling_notifications_requires_credentials() {
    let t = create_test_engine(settings(true));

    assert!(!t.handle.set_notifications_enabled(true));
    assert!(t.handle.notifications_enabled());

    t.handle.set_credentials(Some(Credentials::new("YOUR_USER_KEY", "YOUR_API_TOKEN")));
    assert!(!t.handle.set_notifications_enabled(true));

    t.handle.set_credentials(Some(Credentials::new("u-123", "t-456")));
    assert!(t.handle.set_notifications_enabled(true));
    // Disabling never warns
    t.handle.set_credentials(None);
    assert!(t.handle.set_notifications_enabled(false));
}
