//! Error taxonomy for the timing engine
//!
//! None of these are fatal to the process. Transport and connection errors
//! are retryable by re-invoking the operation; timing errors drop at most one
//! measurement and are always surfaced as a report event.

use thiserror::Error;

/// Failure reported by the BLE peripheral collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {message}")]
pub struct TransportError {
    pub operation: &'static str,
    pub message: String,
}

impl TransportError {
    pub fn new(operation: &'static str, message: impl Into<String>) -> Self {
        Self { operation, message: message.into() }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("already connected, disconnect first")]
    AlreadyConnected,

    #[error("device not found: '{0}'. Run a scan and pick a listed device.")]
    DeviceNotFound(String),

    #[error("device exposes no channel that accepts notification subscriptions")]
    NoNotifiableChannel,

    #[error("operation superseded by a disconnect; result discarded")]
    Cancelled,
}

impl ConnectionError {
    /// Returns `true` if simply re-invoking the operation may succeed
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NoNotifiableChannel | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimingError {
    #[error("invalid distance value: '{0}'")]
    InvalidDistance(String),

    #[error("end event received but timer not running")]
    NoSessionActive,

    #[error("non-positive elapsed time, end event rejected")]
    InvalidElapsed,
}

/// Transport failure while talking to the push-notification service
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notification request failed: {0}")]
    Request(String),

    #[error("notification service returned HTTP {status}")]
    HttpStatus { status: u16 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("timing engine is not running")]
    Closed,
}
