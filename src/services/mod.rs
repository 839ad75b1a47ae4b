//! Services - timing logic and state ownership
//!
//! This module contains the core services:
//! - `decoder` - Raw gate payload to typed event
//! - `engine` - Timing state machine actor, sole owner of session and statistics
//! - `stats` - Session and lifetime statistics aggregation
//! - `dispatcher` - Push notification composition and async send worker
//! - `supervisor` - BLE connection lifecycle and payload forwarding

pub mod decoder;
pub mod dispatcher;
pub mod engine;
pub mod stats;
pub mod supervisor;

// Re-export commonly used types
pub use decoder::{ClassificationTable, EventDecoder};
pub use dispatcher::{create_notify_worker, NotificationDispatcher, NotifierConfig, NotifyWorker};
pub use engine::{create_engine, EngineEvent, EngineHandle, EngineSettings, TimingEngine};
pub use stats::{StatisticsSnapshot, StatsAggregator};
pub use supervisor::ConnectionSupervisor;
