//! BLE peripheral abstraction consumed by the connection supervisor
//!
//! Implementations own the transport. The supervisor only sees device
//! descriptors, opaque handles and channel ids, and hands the transport a
//! callback that forwards raw payload bytes.

use crate::domain::errors::TransportError;
use crate::domain::types::ChannelId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Payload sink invoked from the transport's notification context.
/// Must not block.
pub type NotifyCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Transport address or platform identifier
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self { id: id.into(), name: name.map(str::to_string) }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }
}

#[async_trait]
pub trait Peripheral: Send + Sync + 'static {
    /// Live connection to a single device
    type Handle: Send + Sync + 'static;

    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, TransportError>;

    async fn connect(&self, device_id: &str) -> Result<Self::Handle, TransportError>;

    /// Channels that advertise notification support, in transport order
    async fn list_notifiable_channels(
        &self,
        handle: &Self::Handle,
    ) -> Result<Vec<ChannelId>, TransportError>;

    async fn subscribe(
        &self,
        handle: &Self::Handle,
        channel: &ChannelId,
        callback: NotifyCallback,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, handle: &Self::Handle, channel: &ChannelId)
        -> Result<(), TransportError>;

    async fn disconnect(&self, handle: Self::Handle) -> Result<(), TransportError>;
}
