//! Session and lifetime sprint statistics
//!
//! Pure in-memory bookkeeping, owned by the timing engine task. Session
//! fields reset independently of lifetime fields, and both top speeds only
//! move on a strictly faster sprint so the earliest record of a speed is kept.

use crate::domain::types::SprintRecord;
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of sprints kept in the recent history
pub const HISTORY_LIMIT: usize = 20;

/// Which records a sprint broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RecordOutcome {
    pub session_record_broken: bool,
    pub lifetime_record_broken: bool,
}

/// Read-only copy of the statistics handed to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub all_time_top_speed: f64,
    pub all_time_top_speed_time: f64,
    pub session_top_speed: f64,
    pub session_top_speed_time: f64,
    /// `None` until a sprint has been recorded this session
    pub session_best_time: Option<f64>,
    /// Newest first
    pub history: Vec<SprintRecord>,
}

#[derive(Debug, Default)]
struct Statistics {
    all_time_top_speed: f64,
    all_time_top_speed_time: f64,
    session_top_speed: f64,
    session_top_speed_time: f64,
    session_best_time: Option<f64>,
    history: VecDeque<SprintRecord>,
}

/// Single-writer owner of [`Statistics`]
#[derive(Debug, Default)]
pub struct StatsAggregator {
    stats: Statistics,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a completed sprint into the statistics
    pub fn record(&mut self, sprint: SprintRecord) -> RecordOutcome {
        let stats = &mut self.stats;
        let mut outcome = RecordOutcome::default();

        if sprint.speed_kmh > stats.session_top_speed {
            stats.session_top_speed = sprint.speed_kmh;
            stats.session_top_speed_time = sprint.elapsed_seconds;
            outcome.session_record_broken = true;
        }

        if sprint.speed_kmh > stats.all_time_top_speed {
            stats.all_time_top_speed = sprint.speed_kmh;
            stats.all_time_top_speed_time = sprint.elapsed_seconds;
            outcome.lifetime_record_broken = true;
        }

        stats.session_best_time = Some(match stats.session_best_time {
            Some(best) => best.min(sprint.elapsed_seconds),
            None => sprint.elapsed_seconds,
        });

        stats.history.push_front(sprint);
        stats.history.truncate(HISTORY_LIMIT);

        outcome
    }

    /// Reset session-scoped fields. Lifetime fields are untouched.
    pub fn clear_session(&mut self) {
        let stats = &mut self.stats;
        stats.session_top_speed = 0.0;
        stats.session_top_speed_time = 0.0;
        stats.session_best_time = None;
        stats.history.clear();
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let stats = &self.stats;
        StatisticsSnapshot {
            all_time_top_speed: stats.all_time_top_speed,
            all_time_top_speed_time: stats.all_time_top_speed_time,
            session_top_speed: stats.session_top_speed,
            session_top_speed_time: stats.session_top_speed_time,
            session_best_time: stats.session_best_time,
            history: stats.history.iter().cloned().collect(),
        }
    }

    #[inline]
    pub fn history_len(&self) -> usize {
        self.stats.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn sprint_with_speed(speed_kmh: f64) -> SprintRecord {
        // 20 m at the requested speed
        let elapsed = 20.0 / (speed_kmh / 3.6);
        SprintRecord { elapsed_seconds: elapsed, distance_meters: 20.0, speed_kmh, timestamp: Local::now() }
    }

    #[test]
    fn test_first_sprint_breaks_both_records() {
        let mut agg = StatsAggregator::new();
        let outcome = agg.record(SprintRecord::new(2.857, 20.0, Local::now()));

        assert!(outcome.session_record_broken);
        assert!(outcome.lifetime_record_broken);

        let snap = agg.snapshot();
        assert!((snap.session_top_speed - 25.2).abs() < 0.01);
        assert!((snap.all_time_top_speed - 25.2).abs() < 0.01);
        assert_eq!(snap.session_best_time, Some(2.857));
    }

    #[test]
    fn test_slower_sprint_keeps_session_top() {
        let mut agg = StatsAggregator::new();
        agg.record(sprint_with_speed(25.0));
        let outcome = agg.record(sprint_with_speed(24.0));

        assert!(!outcome.session_record_broken);
        assert!(!outcome.lifetime_record_broken);
        assert_eq!(agg.snapshot().session_top_speed, 25.0);
    }

    #[test]
    fn test_tie_does_not_update() {
        let mut agg = StatsAggregator::new();
        let first = sprint_with_speed(25.0);
        let first_time = first.elapsed_seconds;
        agg.record(first);

        let mut tie = sprint_with_speed(25.0);
        tie.elapsed_seconds = first_time + 1.0;
        let outcome = agg.record(tie);

        assert!(!outcome.session_record_broken);
        assert_eq!(agg.snapshot().session_top_speed_time, first_time);
    }

    #[test]
    fn test_history_bounded_newest_first() {
        let mut agg = StatsAggregator::new();
        for i in 0..45 {
            agg.record(sprint_with_speed(10.0 + i as f64));
            assert!(agg.history_len() <= HISTORY_LIMIT);
        }
        let snap = agg.snapshot();
        assert_eq!(snap.history.len(), HISTORY_LIMIT);
        assert_eq!(snap.history[0].speed_kmh, 54.0);
        assert_eq!(snap.history[HISTORY_LIMIT - 1].speed_kmh, 35.0);
    }

    #[test]
    fn test_best_time_is_minimum() {
        let mut agg = StatsAggregator::new();
        agg.record(sprint_with_speed(20.0)); // 3.6 s
        agg.record(sprint_with_speed(30.0)); // 2.4 s
        agg.record(sprint_with_speed(24.0)); // 3.0 s
        let best = agg.snapshot().session_best_time.unwrap();
        assert!((best - 2.4).abs() < 1e-9);
    }

    #[test]
    fn test_clear_session_keeps_lifetime() {
        let mut agg = StatsAggregator::new();
        agg.record(sprint_with_speed(30.0));
        agg.clear_session();

        let snap = agg.snapshot();
        assert_eq!(snap.session_top_speed, 0.0);
        assert_eq!(snap.session_top_speed_time, 0.0);
        assert_eq!(snap.session_best_time, None);
        assert!(snap.history.is_empty());
        assert_eq!(snap.all_time_top_speed, 30.0);

        // A slower sprint after the clear is a session record only
        let outcome = agg.record(sprint_with_speed(22.0));
        assert!(outcome.session_record_broken);
        assert!(!outcome.lifetime_record_broken);
    }

    #[test]
    fn test_lifetime_never_below_session() {
        let mut agg = StatsAggregator::new();
        let speeds = [18.0, 27.5, 22.0, 31.0, 12.0, 31.0, 29.9];
        let mut last_lifetime = 0.0;
        for (i, speed) in speeds.iter().enumerate() {
            agg.record(sprint_with_speed(*speed));
            if i == 3 {
                agg.clear_session();
            }
            let snap = agg.snapshot();
            assert!(snap.all_time_top_speed >= snap.session_top_speed);
            assert!(snap.all_time_top_speed >= last_lifetime);
            last_lifetime = snap.all_time_top_speed;
        }
    }
}
