//! Notification dispatcher - forwards sprint results to a push service
//!
//! The engine never waits on the network. It enqueues a [`NotifyRequest`] via
//! `try_send` and the [`NotifyWorker`] makes exactly one send attempt per
//! request. There is no retry. Failures are logged, counted and surfaced as
//! [`EngineReport::NotificationFailed`].

use crate::domain::errors::NotifierError;
use crate::domain::types::SprintRecord;
use crate::infra::metrics::Metrics;
use crate::services::engine::{EngineEvent, EngineReport};
use crate::services::stats::RecordOutcome;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub const NOTIFICATION_TITLE: &str = "Sprint Timer Result";
pub const TEST_NOTIFICATION_TITLE: &str = "Test Notification";
pub const TEST_NOTIFICATION_BODY: &str = "This is a test notification from the sprint timer.";

/// Values shipped in sample configs that must never be sent
const PLACEHOLDER_VALUES: [&str; 3] = ["", "YOUR_USER_KEY", "YOUR_API_TOKEN"];

/// Push service credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_key: String,
    pub api_token: String,
}

impl Credentials {
    pub fn new(user_key: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self { user_key: user_key.into(), api_token: api_token.into() }
    }

    /// True when either value is empty or a sample placeholder
    pub fn is_placeholder(&self) -> bool {
        [&self.user_key, &self.api_token]
            .iter()
            .any(|v| PLACEHOLDER_VALUES.contains(&v.trim()))
    }
}

// Keep secrets out of logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_key", &"<redacted>")
            .field("api_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub credentials: Option<Credentials>,
}

impl NotifierConfig {
    pub fn from_parts(enabled: bool, user_key: Option<&str>, api_token: Option<&str>) -> Self {
        let credentials = match (user_key, api_token) {
            (Some(user), Some(token)) => Some(Credentials::new(user, token)),
            _ => None,
        };
        Self { enabled, credentials }
    }

    /// Usable credentials: present and not a sample placeholder
    pub fn credentials_ready(&self) -> bool {
        self.credentials.as_ref().is_some_and(|c| !c.is_placeholder())
    }

    pub fn shared(self) -> SharedNotifierConfig {
        Arc::new(RwLock::new(self))
    }
}

/// Written only by user commands, read by the dispatcher
pub type SharedNotifierConfig = Arc<RwLock<NotifierConfig>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Malformed,
}

/// Parsed response of the push service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierReply {
    pub status: ReplyStatus,
    pub raw: String,
}

impl NotifierReply {
    pub fn ok(raw: impl Into<String>) -> Self {
        Self { status: ReplyStatus::Ok, raw: raw.into() }
    }
}

/// Push transport. One call is one delivery attempt.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        credentials: &Credentials,
        title: &str,
        body: &str,
    ) -> Result<NotifierReply, NotifierError>;
}

/// Build the message body for a sprint
pub fn compose_message(record: &SprintRecord, broke_session: bool, broke_lifetime: bool) -> String {
    let mut body = format!(
        "Time: {:.3} s\nSpeed: {:.1} km/h\nDistance: {} m\nRecorded at: {}",
        record.elapsed_seconds,
        record.speed_kmh,
        record.distance_meters,
        record.timestamp.format("%H:%M:%S"),
    );
    if broke_session {
        body.push_str("\n[New session top speed!]");
    }
    if broke_lifetime {
        body.push_str("\n[New all-time top speed!]");
    }
    body
}

pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    config: SharedNotifierConfig,
    metrics: Arc<Metrics>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, config: SharedNotifierConfig, metrics: Arc<Metrics>) -> Self {
        Self { notifier, config, metrics }
    }

    /// Send a sprint result. Returns `true` when disabled or delivered.
    pub async fn notify(&self, record: &SprintRecord, broke_session: bool, broke_lifetime: bool) -> bool {
        let credentials = {
            let config = self.config.read();
            if !config.enabled {
                debug!("notifications_disabled");
                return true;
            }
            match &config.credentials {
                Some(credentials) if !credentials.is_placeholder() => credentials.clone(),
                _ => {
                    warn!("notification_skipped_missing_credentials");
                    return false;
                }
            }
        };
        let body = compose_message(record, broke_session, broke_lifetime);
        self.deliver(&credentials, NOTIFICATION_TITLE, &body).await
    }

    /// Send a fixed test message, ignoring the enabled flag
    pub async fn test_notification(&self) -> bool {
        let credentials = self.config.read().credentials.clone();
        match credentials {
            Some(credentials) if !credentials.is_placeholder() => {
                self.deliver(&credentials, TEST_NOTIFICATION_TITLE, TEST_NOTIFICATION_BODY).await
            }
            _ => {
                warn!("test_notification_missing_credentials");
                false
            }
        }
    }

    async fn deliver(&self, credentials: &Credentials, title: &str, body: &str) -> bool {
        let send_start = Instant::now();
        let result = self.notifier.send(credentials, title, body).await;
        let latency_ms = send_start.elapsed().as_millis() as u64;

        let sent = match result {
            Ok(reply) if reply.status == ReplyStatus::Ok => {
                info!(title = %title, latency_ms = %latency_ms, "notification_sent");
                true
            }
            Ok(reply) => {
                warn!(
                    title = %title,
                    status = ?reply.status,
                    reply = %reply.raw,
                    latency_ms = %latency_ms,
                    "notification_failed"
                );
                false
            }
            Err(e) => {
                warn!(title = %title, error = %e, latency_ms = %latency_ms, "notification_failed");
                false
            }
        };
        self.metrics.record_notification(sent, latency_ms);
        sent
    }
}

/// A sprint waiting to be notified
#[derive(Debug)]
pub struct NotifyRequest {
    pub record: SprintRecord,
    pub outcome: RecordOutcome,
    /// When the request was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

impl NotifyRequest {
    pub fn new(record: SprintRecord, outcome: RecordOutcome) -> Self {
        Self { record, outcome, enqueued_at: Instant::now() }
    }
}

/// Worker that sends notifications off the engine task
pub struct NotifyWorker {
    dispatcher: Arc<NotificationDispatcher>,
    request_rx: mpsc::Receiver<NotifyRequest>,
    events: broadcast::Sender<EngineEvent>,
}

impl NotifyWorker {
    pub fn new(
        dispatcher: Arc<NotificationDispatcher>,
        request_rx: mpsc::Receiver<NotifyRequest>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self { dispatcher, request_rx, events }
    }

    /// Run the worker, processing requests until the channel closes
    pub async fn run(mut self) {
        info!("notify_worker_started");

        while let Some(req) = self.request_rx.recv().await {
            let queue_delay_ms = req.enqueued_at.elapsed().as_millis() as u64;
            let sent = self
                .dispatcher
                .notify(&req.record, req.outcome.session_record_broken, req.outcome.lifetime_record_broken)
                .await;

            debug!(queue_delay_ms = %queue_delay_ms, sent = %sent, "notify_request_processed");
            if !sent {
                let _ = self.events.send(EngineEvent::Report(EngineReport::NotificationFailed));
            }
        }

        info!("notify_worker_stopped");
    }
}

/// Create a notification queue and worker
///
/// Returns the sender (for the engine) and the worker (to be spawned)
pub fn create_notify_worker(
    dispatcher: Arc<NotificationDispatcher>,
    events: broadcast::Sender<EngineEvent>,
    buffer_size: usize,
) -> (mpsc::Sender<NotifyRequest>, NotifyWorker) {
    let (request_tx, request_rx) = mpsc::channel(buffer_size);
    let worker = NotifyWorker::new(dispatcher, request_rx, events);
    (request_tx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};
    use parking_lot::Mutex;

    /// Records every send and answers with a fixed reply
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
        reply: Result<ReplyStatus, u16>,
    }

    impl RecordingNotifier {
        fn replying(status: ReplyStatus) -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), reply: Ok(status) })
        }

        fn failing_with_status(status: u16) -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), reply: Err(status) })
        }

        fn calls(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(
            &self,
            _credentials: &Credentials,
            title: &str,
            body: &str,
        ) -> Result<NotifierReply, NotifierError> {
            self.sent.lock().push((title.to_string(), body.to_string()));
            match self.reply {
                Ok(status) => Ok(NotifierReply { status, raw: String::new() }),
                Err(status) => Err(NotifierError::HttpStatus { status }),
            }
        }
    }

    fn record() -> SprintRecord {
        let ts = Local.with_ymd_and_hms(2024, 5, 1, 14, 3, 27).unwrap();
        SprintRecord::new(2.857, 20.0, ts)
    }

    fn dispatcher(notifier: Arc<RecordingNotifier>, config: NotifierConfig) -> NotificationDispatcher {
        NotificationDispatcher::new(notifier, config.shared(), Arc::new(Metrics::new()))
    }

    fn enabled_with(user: &str, token: &str) -> NotifierConfig {
        NotifierConfig { enabled: true, credentials: Some(Credentials::new(user, token)) }
    }

    #[test]
    fn test_compose_message() {
        let body = compose_message(&record(), true, false);
        assert!(body.contains("Time: 2.857 s"));
        assert!(body.contains("Speed: 25.2 km/h"));
        assert!(body.contains("Distance: 20 m"));
        assert!(body.contains("Recorded at: 14:03:27"));
        assert!(body.contains("[New session top speed!]"));
        assert!(!body.contains("[New all-time top speed!]"));
    }

    #[test]
    fn test_placeholder_credentials() {
        assert!(Credentials::new("", "abc").is_placeholder());
        assert!(Credentials::new("YOUR_USER_KEY", "abc").is_placeholder());
        assert!(Credentials::new("u123", "YOUR_API_TOKEN").is_placeholder());
        assert!(!Credentials::new("u123", "t456").is_placeholder());
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let rendered = format!("{:?}", Credentials::new("u-secret", "t-secret"));
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn test_disabled_returns_true_without_send() {
        let notifier = RecordingNotifier::replying(ReplyStatus::Ok);
        let d = dispatcher(notifier.clone(), NotifierConfig::default());
        assert!(d.notify(&record(), true, true).await);
        assert_eq!(notifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_enabled_without_credentials_returns_false() {
        let notifier = RecordingNotifier::replying(ReplyStatus::Ok);
        let d = dispatcher(notifier.clone(), NotifierConfig { enabled: true, credentials: None });
        assert!(!d.notify(&record(), false, false).await);

        let d = dispatcher(notifier.clone(), enabled_with("YOUR_USER_KEY", "YOUR_API_TOKEN"));
        assert!(!d.notify(&record(), false, false).await);
        assert_eq!(notifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_attempt_with_title() {
        let notifier = RecordingNotifier::replying(ReplyStatus::Ok);
        let d = dispatcher(notifier.clone(), enabled_with("u123", "t456"));
        assert!(d.notify(&record(), true, true).await);

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, NOTIFICATION_TITLE);
        assert!(sent[0].1.contains("[New all-time top speed!]"));
    }

    #[tokio::test]
    async fn test_error_replies_return_false() {
        for status in [ReplyStatus::Error, ReplyStatus::Malformed] {
            let notifier = RecordingNotifier::replying(status);
            let d = dispatcher(notifier.clone(), enabled_with("u123", "t456"));
            assert!(!d.notify(&record(), false, false).await);
            assert_eq!(notifier.calls(), 1, "no retry on {status:?}");
        }

        let notifier = RecordingNotifier::failing_with_status(500);
        let d = dispatcher(notifier.clone(), enabled_with("u123", "t456"));
        assert!(!d.notify(&record(), false, false).await);
        assert_eq!(notifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_test_notification_ignores_enabled_flag() {
        let notifier = RecordingNotifier::replying(ReplyStatus::Ok);
        let mut config = enabled_with("u123", "t456");
        config.enabled = false;
        let d = dispatcher(notifier.clone(), config);
        assert!(d.test_notification().await);
        assert_eq!(notifier.sent.lock()[0].0, TEST_NOTIFICATION_TITLE);
    }

    #[tokio::test]
    async fn test_worker_reports_failure() {
        let notifier = RecordingNotifier::replying(ReplyStatus::Error);
        let d = Arc::new(dispatcher(notifier.clone(), enabled_with("u123", "t456")));
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let (tx, worker) = create_notify_worker(d, events_tx, 4);
        let worker_task = tokio::spawn(worker.run());

        tx.send(NotifyRequest::new(record(), RecordOutcome::default())).await.unwrap();
        drop(tx);
        worker_task.await.unwrap();

        assert_eq!(notifier.calls(), 1);
        assert!(matches!(
            events_rx.try_recv(),
            Ok(EngineEvent::Report(EngineReport::NotificationFailed))
        ));
    }

    #[test]
    fn test_config_from_parts() {
        let config = NotifierConfig::from_parts(true, Some("u"), None);
        assert!(config.credentials.is_none());
        let config = NotifierConfig::from_parts(true, Some("u"), Some("t"));
        assert_eq!(config.credentials, Some(Credentials::new("u", "t")));
    }
}
