//! Shared types for the sprint timing engine

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Conversion factor from metres per second to kilometres per hour
pub const MPS_TO_KMH: f64 = 3.6;

/// Newtype wrapper for lane numbers to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lane(pub u8);

impl Default for Lane {
    fn default() -> Self {
        Lane(1)
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Classification of a single gate notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    End,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::End => "end",
            EventKind::Unknown => "unknown",
        }
    }
}

/// Decoded gate event, derived per notification and never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateEvent {
    pub kind: EventKind,
    pub lane: Lane,
}

impl GateEvent {
    #[inline]
    pub fn new(kind: EventKind, lane: Lane) -> Self {
        Self { kind, lane }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingState {
    Idle,
    Timing,
}

/// The single timing session owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSession {
    pub state: TimingState,
    pub start_instant: Option<Instant>,
}

impl TimingSession {
    pub fn idle() -> Self {
        Self { state: TimingState::Idle, start_instant: None }
    }

    pub fn started_at(instant: Instant) -> Self {
        Self { state: TimingState::Timing, start_instant: Some(instant) }
    }

    #[inline]
    pub fn is_timing(&self) -> bool {
        self.state == TimingState::Timing
    }
}

impl Default for TimingSession {
    fn default() -> Self {
        Self::idle()
    }
}

/// A completed sprint. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SprintRecord {
    pub elapsed_seconds: f64,
    pub distance_meters: f64,
    pub speed_kmh: f64,
    pub timestamp: DateTime<Local>,
}

impl SprintRecord {
    /// Build a record from a validated elapsed time and distance
    pub fn new(elapsed_seconds: f64, distance_meters: f64, timestamp: DateTime<Local>) -> Self {
        Self {
            elapsed_seconds,
            distance_meters,
            speed_kmh: speed_kmh(distance_meters, elapsed_seconds),
            timestamp,
        }
    }
}

/// Average speed in km/h over `distance_meters` covered in `elapsed_seconds`
#[inline]
pub fn speed_kmh(distance_meters: f64, elapsed_seconds: f64) -> f64 {
    (distance_meters / elapsed_seconds) * MPS_TO_KMH
}

/// Fixed sprint distances offered by the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistancePreset {
    Twenty,
    Forty,
}

impl DistancePreset {
    pub fn meters(&self) -> f64 {
        match self {
            DistancePreset::Twenty => 20.0,
            DistancePreset::Forty => 40.0,
        }
    }
}

/// Configured sprint distance
///
/// Custom values keep the raw user text and are only parsed when a sprint
/// ends, so a bad entry consumes the session instead of blocking the start.
#[derive(Debug, Clone, PartialEq)]
pub enum Distance {
    Preset(DistancePreset),
    Custom(String),
}

impl Default for Distance {
    fn default() -> Self {
        Distance::Preset(DistancePreset::Twenty)
    }
}

impl Distance {
    /// Parse user input: `20`/`40` select a preset, anything else is custom
    pub fn from_input(input: &str) -> Self {
        match input.trim() {
            "20" => Distance::Preset(DistancePreset::Twenty),
            "40" => Distance::Preset(DistancePreset::Forty),
            other => Distance::Custom(other.to_string()),
        }
    }

    /// Resolve to metres. `None` when a custom value is not a positive number.
    pub fn resolve(&self) -> Option<f64> {
        match self {
            Distance::Preset(preset) => Some(preset.meters()),
            Distance::Custom(raw) => {
                raw.trim().parse::<f64>().ok().filter(|m| m.is_finite() && *m > 0.0)
            }
        }
    }
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Distance::Preset(preset) => write!(f, "{}", preset.meters()),
            Distance::Custom(raw) => write!(f, "custom({raw})"),
        }
    }
}

/// Peripheral connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// Opaque identifier of a notification-capable characteristic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId(pub String);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection owned by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralConnection {
    pub state: ConnectionState,
    pub channel: Option<ChannelId>,
}

impl Default for PeripheralConnection {
    fn default() -> Self {
        Self { state: ConnectionState::Disconnected, channel: None }
    }
}
