//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the notification callback, the engine task and the
//! dispatcher worker can all record without contending on a mutex.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not drive timing logic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Notification send latency bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Lock-free metrics collector shared by all engine components
pub struct Metrics {
    /// Raw notification payloads handed to the engine
    payloads_received: AtomicU64,
    /// Payloads dropped because the engine queue was full
    payloads_dropped: AtomicU64,
    events_start: AtomicU64,
    events_end: AtomicU64,
    events_unknown: AtomicU64,
    /// Events filtered because they came from another lane
    foreign_lane_filtered: AtomicU64,
    sprints_completed: AtomicU64,
    /// End transitions that produced no record (bad distance, bad elapsed)
    sprints_rejected: AtomicU64,
    /// Sessions discarded by auto-reset or manual reset
    sessions_aborted: AtomicU64,
    /// End events while idle
    no_session_ends: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    notifications_dropped: AtomicU64,
    notify_latency_buckets: [AtomicU64; NUM_BUCKETS],
    notify_latency_sum_ms: AtomicU64,
    notify_latency_max_ms: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            payloads_received: AtomicU64::new(0),
            payloads_dropped: AtomicU64::new(0),
            events_start: AtomicU64::new(0),
            events_end: AtomicU64::new(0),
            events_unknown: AtomicU64::new(0),
            foreign_lane_filtered: AtomicU64::new(0),
            sprints_completed: AtomicU64::new(0),
            sprints_rejected: AtomicU64::new(0),
            sessions_aborted: AtomicU64::new(0),
            no_session_ends: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            notify_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            notify_latency_sum_ms: AtomicU64::new(0),
            notify_latency_max_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn record_payload_received(&self) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_payload_dropped(&self) {
        self.payloads_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_start_event(&self) {
        self.events_start.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_end_event(&self) {
        self.events_end.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unknown_event(&self) {
        self.events_unknown.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_foreign_lane(&self) {
        self.foreign_lane_filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sprint_completed(&self) {
        self.sprints_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sprint_rejected(&self) {
        self.sprints_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_aborted(&self) {
        self.sessions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_no_session_end(&self) {
        self.no_session_ends.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one notification send attempt and its latency
    #[inline]
    pub fn record_notification(&self, sent: bool, latency_ms: u64) {
        if sent {
            self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.notify_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.notify_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.notify_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn sprints_completed(&self) -> u64 {
        self.sprints_completed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn payloads_received(&self) -> u64 {
        self.payloads_received.load(Ordering::Relaxed)
    }

    /// Consistent-enough point-in-time view of all counters.
    /// Counters are monotonic; nothing is reset.
    pub fn report(&self) -> MetricsSummary {
        let notify_latency_buckets = load_buckets(&self.notify_latency_buckets);
        let notify_count: u64 = notify_latency_buckets.iter().sum();
        let notify_sum = self.notify_latency_sum_ms.load(Ordering::Relaxed);
        let notify_latency_avg_ms = if notify_count > 0 { notify_sum / notify_count } else { 0 };

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            payloads_dropped: self.payloads_dropped.load(Ordering::Relaxed),
            events_start: self.events_start.load(Ordering::Relaxed),
            events_end: self.events_end.load(Ordering::Relaxed),
            events_unknown: self.events_unknown.load(Ordering::Relaxed),
            foreign_lane_filtered: self.foreign_lane_filtered.load(Ordering::Relaxed),
            sprints_completed: self.sprints_completed.load(Ordering::Relaxed),
            sprints_rejected: self.sprints_rejected.load(Ordering::Relaxed),
            sessions_aborted: self.sessions_aborted.load(Ordering::Relaxed),
            no_session_ends: self.no_session_ends.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            notify_latency_buckets,
            notify_latency_sum_ms: notify_sum,
            notify_latency_avg_ms,
            notify_latency_max_ms: self.notify_latency_max_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub payloads_received: u64,
    pub payloads_dropped: u64,
    pub events_start: u64,
    pub events_end: u64,
    pub events_unknown: u64,
    pub foreign_lane_filtered: u64,
    pub sprints_completed: u64,
    pub sprints_rejected: u64,
    pub sessions_aborted: u64,
    pub no_session_ends: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub notifications_dropped: u64,
    /// Send latency histogram (ms), bounds in [`METRICS_BUCKET_BOUNDS`]
    pub notify_latency_buckets: [u64; NUM_BUCKETS],
    pub notify_latency_sum_ms: u64,
    pub notify_latency_avg_ms: u64,
    pub notify_latency_max_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            payloads = %self.payloads_received,
            payloads_dropped = %self.payloads_dropped,
            starts = %self.events_start,
            ends = %self.events_end,
            unknown = %self.events_unknown,
            foreign_lane = %self.foreign_lane_filtered,
            sprints = %self.sprints_completed,
            rejected = %self.sprints_rejected,
            aborted = %self.sessions_aborted,
            notify_sent = %self.notifications_sent,
            notify_failed = %self.notifications_failed,
            notify_avg_ms = %self.notify_latency_avg_ms,
            "metrics"
        );
    }
}
