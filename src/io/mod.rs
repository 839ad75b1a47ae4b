//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `peripheral` - BLE peripheral trait consumed by the supervisor
//! - `sim` - In-process simulated timing hub
//! - `btle` - btleplug transport (feature `ble`)
//! - `pushover` - Pushover HTTP notifier
//! - `console` - stdin command parser and event renderer
//! - `prometheus` - Prometheus metrics HTTP endpoint

#[cfg(feature = "ble")]
pub mod btle;
pub mod console;
pub mod peripheral;
pub mod prometheus;
pub mod pushover;
pub mod sim;

// Re-export commonly used types
pub use peripheral::{DeviceInfo, NotifyCallback, Peripheral};
pub use pushover::PushoverNotifier;
pub use sim::SimulatedPeripheral;
