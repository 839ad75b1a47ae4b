//! Timing engine actor
//!
//! The engine is the single owner of the [`TimingSession`] and the
//! [`StatsAggregator`]. Everything that can change them reaches the engine
//! task as an [`EngineCommand`]:
//! - gate payloads forwarded by the peripheral callback
//! - manual start / end / reset from the presentation layer
//! - configuration changes (distance, lane, auto-reset)
//!
//! Observers never touch engine state. They read the session through a
//! `watch` channel and follow the [`EngineEvent`] broadcast stream.

mod handlers;
#[cfg(test)]
mod tests;

use crate::domain::errors::{EngineError, TimingError};
use crate::domain::types::{ConnectionState, Distance, Lane, SprintRecord, TimingSession};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::decoder::{ClassificationTable, EventDecoder};
use crate::services::dispatcher::{Credentials, NotifyRequest, SharedNotifierConfig};
use crate::services::stats::{RecordOutcome, StatisticsSnapshot, StatsAggregator};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Display refresh period while a session is running
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Delay after a completed sprint before the advisory ready signal
pub const READY_COOLDOWN: Duration = Duration::from_secs(5);

/// Commands accepted by the engine task
#[derive(Debug)]
pub enum EngineCommand {
    /// Raw notification payload from the gate peripheral
    Deliver(Bytes),
    StartManually,
    EndManually,
    Reset,
    SetDistance(Distance),
    SetAutoReset(bool),
    SetLane(Lane),
    ClearSession,
    Snapshot(oneshot::Sender<StatisticsSnapshot>),
}

/// Non-fatal conditions surfaced to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineReport {
    /// A gate or manual event was rejected by the state machine
    Timing(TimingError),
    /// Start while timing with auto-reset off
    StartIgnored,
    /// The notification for a sprint could not be delivered
    NotificationFailed,
    /// The notification queue was full and the request was dropped
    NotificationDropped,
}

/// Observable engine stream
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Elapsed time of the running session, every [`TICK_INTERVAL`]
    Tick(Duration),
    SessionStarted,
    /// Running session discarded without a record
    SessionAborted,
    SprintCompleted {
        record: SprintRecord,
        outcome: RecordOutcome,
        snapshot: StatisticsSnapshot,
    },
    /// Advisory signal that the gate can be used again
    Ready,
    ConnectionStateChanged(ConnectionState),
    Report(EngineReport),
}

/// Initial engine settings
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub distance: Distance,
    pub auto_reset: bool,
    pub lane: Lane,
    pub classification: ClassificationTable,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            distance: config.distance().clone(),
            auto_reset: config.auto_reset(),
            lane: config.lane(),
            classification: config.classification().clone(),
        }
    }
}

/// The timing actor. Build with [`create_engine`] and spawn [`TimingEngine::run`].
pub struct TimingEngine {
    pub(crate) session: TimingSession,
    pub(crate) stats: StatsAggregator,
    pub(crate) decoder: EventDecoder,
    pub(crate) distance: Distance,
    pub(crate) auto_reset: bool,
    pub(crate) lane: Lane,
    /// Pending advisory ready signal
    pub(crate) ready_deadline: Option<Instant>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) notify_tx: Option<mpsc::Sender<NotifyRequest>>,
    pub(crate) events: broadcast::Sender<EngineEvent>,
    pub(crate) session_tx: watch::Sender<TimingSession>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
}

/// Create the engine and a handle to it
///
/// `notify_tx` is the dispatcher worker queue, `None` to skip notifications
/// entirely.
pub fn create_engine(
    settings: EngineSettings,
    metrics: Arc<Metrics>,
    notifier_config: SharedNotifierConfig,
    notify_tx: Option<mpsc::Sender<NotifyRequest>>,
    events: broadcast::Sender<EngineEvent>,
    queue_size: usize,
) -> (EngineHandle, TimingEngine) {
    let (cmd_tx, cmd_rx) = mpsc::channel(queue_size);
    let (session_tx, session_rx) = watch::channel(TimingSession::idle());

    let engine = TimingEngine {
        session: TimingSession::idle(),
        stats: StatsAggregator::new(),
        decoder: EventDecoder::new(settings.classification),
        distance: settings.distance,
        auto_reset: settings.auto_reset,
        lane: settings.lane,
        ready_deadline: None,
        metrics: metrics.clone(),
        notify_tx,
        events: events.clone(),
        session_tx,
        cmd_rx,
    };

    let handle = EngineHandle { cmd_tx, events, session: session_rx, notifier_config, metrics };
    (handle, engine)
}

impl TimingEngine {
    /// Run the actor until every [`EngineHandle`] is dropped
    pub async fn run(mut self) {
        let mut tick = interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            distance = %self.distance,
            auto_reset = %self.auto_reset,
            lane = %self.lane,
            "timing_engine_started"
        );

        loop {
            let ready_at = self.ready_deadline;
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    let started_before = self.session.start_instant;
                    self.handle_command(cmd);
                    // Align ticks to the new session start
                    if self.session.is_timing() && self.session.start_instant != started_before {
                        tick.reset();
                    }
                }
                _ = tick.tick(), if self.session.is_timing() => {
                    self.emit_tick();
                }
                _ = sleep_until(ready_at.unwrap_or_else(Instant::now)), if ready_at.is_some() => {
                    self.fire_ready();
                }
            }
        }

        info!("timing_engine_stopped");
    }

    /// Current session (test and diagnostics helper)
    pub fn session(&self) -> TimingSession {
        self.session
    }
}

/// Cloneable front door to the engine task
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    session: watch::Receiver<TimingSession>,
    notifier_config: SharedNotifierConfig,
    metrics: Arc<Metrics>,
}

impl EngineHandle {
    /// Delivery entry point for the peripheral callback. Never blocks.
    pub fn deliver(&self, payload: Bytes) {
        self.metrics.record_payload_received();
        match self.cmd_tx.try_send(EngineCommand::Deliver(payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_payload_dropped();
                warn!("payload_dropped_queue_full");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("payload_dropped_engine_closed");
            }
        }
    }

    async fn send(&self, cmd: EngineCommand) -> Result<(), EngineError> {
        self.cmd_tx.send(cmd).await.map_err(|_| EngineError::Closed)
    }

    pub async fn start_manually(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::StartManually).await
    }

    pub async fn end_manually(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::EndManually).await
    }

    pub async fn reset(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Reset).await
    }

    pub async fn set_distance(&self, distance: Distance) -> Result<(), EngineError> {
        self.send(EngineCommand::SetDistance(distance)).await
    }

    pub async fn set_auto_reset(&self, enabled: bool) -> Result<(), EngineError> {
        self.send(EngineCommand::SetAutoReset(enabled)).await
    }

    pub async fn set_lane(&self, lane: Lane) -> Result<(), EngineError> {
        self.send(EngineCommand::SetLane(lane)).await
    }

    pub async fn clear_session(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::ClearSession).await
    }

    pub async fn snapshot(&self) -> Result<StatisticsSnapshot, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| EngineError::Closed)
    }

    /// Toggle push notifications. Returns false when enabling without
    /// usable credentials, in which case sends will be skipped.
    pub fn set_notifications_enabled(&self, enabled: bool) -> bool {
        let ready = {
            let mut config = self.notifier_config.write();
            config.enabled = enabled;
            config.credentials_ready()
        };
        info!(enabled = %enabled, "notifications_toggled");
        if enabled && !ready {
            warn!("notifications_enabled_without_credentials");
            return false;
        }
        true
    }

    /// Replace the push service credentials. `None` clears them.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        let present = credentials.is_some();
        self.notifier_config.write().credentials = credentials;
        info!(present = %present, "notification_credentials_updated");
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifier_config.read().enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Last completed session transition
    pub fn session(&self) -> TimingSession {
        *self.session.borrow()
    }

    pub fn session_watch(&self) -> watch::Receiver<TimingSession> {
        self.session.clone()
    }

    /// Publish an event from a collaborator (connection state changes)
    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
