//! Transition handlers for the TimingEngine
//!
//! Each handler runs on the engine task and leaves the session in a completed
//! state before returning, so the `watch` channel never exposes a half-applied
//! transition.

use super::{EngineCommand, EngineEvent, EngineReport, TimingEngine, READY_COOLDOWN};
use crate::domain::errors::TimingError;
use crate::domain::types::{Distance, EventKind, SprintRecord, TimingSession};
use crate::services::decoder::DecodeOutcome;
use crate::services::dispatcher::NotifyRequest;
use crate::services::stats::RecordOutcome;
use chrono::Local;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

impl TimingEngine {
    pub(crate) fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Deliver(payload) => self.handle_payload(&payload),
            EngineCommand::StartManually => self.handle_start("manual"),
            EngineCommand::EndManually => self.handle_end("manual"),
            EngineCommand::Reset => self.handle_reset(),
            EngineCommand::SetDistance(distance) => {
                info!(distance = %distance, "distance_changed");
                self.distance = distance;
            }
            EngineCommand::SetAutoReset(enabled) => {
                info!(enabled = %enabled, "auto_reset_changed");
                self.auto_reset = enabled;
            }
            EngineCommand::SetLane(lane) => {
                info!(lane = %lane, "lane_changed");
                self.lane = lane;
            }
            EngineCommand::ClearSession => {
                self.stats.clear_session();
                info!("session_stats_cleared");
            }
            EngineCommand::Snapshot(reply) => {
                let _ = reply.send(self.stats.snapshot());
            }
        }
    }

    /// Decode a gate payload against the selected lane and apply it
    pub(crate) fn handle_payload(&mut self, payload: &[u8]) {
        match self.decoder.decode_detailed(payload, self.lane) {
            DecodeOutcome::Classified(event) => match event.kind {
                EventKind::Start => {
                    self.metrics.record_start_event();
                    self.handle_start("gate");
                }
                EventKind::End => {
                    self.metrics.record_end_event();
                    self.handle_end("gate");
                }
                EventKind::Unknown => self.metrics.record_unknown_event(),
            },
            DecodeOutcome::ForeignLane { kind, lane } => {
                self.metrics.record_foreign_lane();
                debug!(
                    kind = %kind.as_str(),
                    lane = %lane,
                    selected_lane = %self.lane,
                    "gate_event_filtered"
                );
            }
            DecodeOutcome::UnknownMarker { marker, lane } => {
                self.metrics.record_unknown_event();
                debug!(marker = %format!("0x{marker:02X}"), lane = %lane, "gate_event_unknown");
            }
            DecodeOutcome::Empty => {
                self.metrics.record_unknown_event();
                debug!("gate_payload_empty");
            }
        }
    }

    /// Idle -> Timing, or auto-reset restart while timing
    pub(crate) fn handle_start(&mut self, source: &'static str) {
        let now = Instant::now();

        if self.session.is_timing() {
            if !self.auto_reset {
                debug!(source = %source, "start_ignored_while_timing");
                self.report(EngineReport::StartIgnored);
                return;
            }
            self.metrics.record_session_aborted();
            info!(source = %source, reason = "auto_reset", "session_aborted");
            self.publish(EngineEvent::SessionAborted);
        }

        self.session = TimingSession::started_at(now);
        self.publish_session();
        info!(source = %source, "session_started");
        self.publish(EngineEvent::SessionStarted);
    }

    /// Timing -> Idle with a sprint record
    pub(crate) fn handle_end(&mut self, source: &'static str) {
        let (true, Some(start)) = (self.session.is_timing(), self.session.start_instant) else {
            self.metrics.record_no_session_end();
            debug!(source = %source, "end_without_session");
            self.report(EngineReport::Timing(TimingError::NoSessionActive));
            return;
        };

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(start);
        if elapsed.is_zero() {
            // Session stays open for a later valid end
            self.metrics.record_sprint_rejected();
            warn!(source = %source, "end_rejected_zero_elapsed");
            self.report(EngineReport::Timing(TimingError::InvalidElapsed));
            return;
        }

        self.session = TimingSession::idle();
        self.publish_session();

        let Some(distance_meters) = self.distance.resolve() else {
            let raw = match &self.distance {
                Distance::Custom(raw) => raw.clone(),
                other => other.to_string(),
            };
            self.metrics.record_sprint_rejected();
            warn!(
                source = %source,
                distance = %raw,
                elapsed_ms = %elapsed.as_millis(),
                "end_rejected_invalid_distance"
            );
            self.report(EngineReport::Timing(TimingError::InvalidDistance(raw)));
            return;
        };

        let record = SprintRecord::new(elapsed.as_secs_f64(), distance_meters, Local::now());
        let outcome = self.stats.record(record.clone());
        self.metrics.record_sprint_completed();

        info!(
            source = %source,
            elapsed_s = %format!("{:.3}", record.elapsed_seconds),
            distance_m = %record.distance_meters,
            speed_kmh = %format!("{:.1}", record.speed_kmh),
            session_record = %outcome.session_record_broken,
            lifetime_record = %outcome.lifetime_record_broken,
            "sprint_completed"
        );

        self.publish(EngineEvent::SprintCompleted {
            record: record.clone(),
            outcome,
            snapshot: self.stats.snapshot(),
        });
        self.enqueue_notification(record, outcome);

        if self.auto_reset {
            self.ready_deadline = Some(now + READY_COOLDOWN);
        }
    }

    pub(crate) fn handle_reset(&mut self) {
        let was_timing = self.session.is_timing();
        self.session = TimingSession::idle();
        self.ready_deadline = None;
        self.publish_session();

        if was_timing {
            self.metrics.record_session_aborted();
            self.publish(EngineEvent::SessionAborted);
        }
        info!(was_timing = %was_timing, "timing_reset");
    }

    pub(crate) fn emit_tick(&self) {
        if let Some(start) = self.session.start_instant {
            self.publish(EngineEvent::Tick(Instant::now().saturating_duration_since(start)));
        }
    }

    pub(crate) fn fire_ready(&mut self) {
        self.ready_deadline = None;
        if self.session.is_timing() {
            debug!("ready_signal_skipped_timing");
            return;
        }
        info!("ready_for_next_sprint");
        self.publish(EngineEvent::Ready);
    }

    /// Hand the record to the dispatcher worker without waiting on it
    fn enqueue_notification(&self, record: SprintRecord, outcome: RecordOutcome) {
        let Some(notify_tx) = &self.notify_tx else {
            return;
        };
        match notify_tx.try_send(NotifyRequest::new(record, outcome)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_notification_dropped();
                warn!("notification_dropped_queue_full");
                self.report(EngineReport::NotificationDropped);
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_notification_dropped();
                warn!("notification_worker_closed");
                self.report(EngineReport::NotificationDropped);
            }
        }
    }

    fn publish_session(&self) {
        self.session_tx.send_replace(self.session);
    }

    fn report(&self, report: EngineReport) {
        self.publish(EngineEvent::Report(report));
    }

    fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
