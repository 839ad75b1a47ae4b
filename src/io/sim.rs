//! In-process simulated timing hub
//!
//! Behaves like a BLE gate peripheral without any radio: discovery returns a
//! fixed device list, subscriptions store the callback, and [`SimulatedPeripheral::inject`]
//! pushes payloads through it. Used by `--simulate` and by tests.

use crate::domain::errors::TransportError;
use crate::domain::types::ChannelId;
use crate::io::peripheral::{DeviceInfo, NotifyCallback, Peripheral};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

/// Descriptor of one simulated characteristic
#[derive(Debug, Clone)]
pub struct SimChannel {
    pub id: ChannelId,
    /// When false, subscribing to this channel fails
    pub accepts_subscription: bool,
}

impl SimChannel {
    pub fn new(id: &str, accepts_subscription: bool) -> Self {
        Self { id: ChannelId(id.to_string()), accepts_subscription }
    }
}

#[derive(Default)]
struct SimState {
    callback: Option<NotifyCallback>,
    subscribed: Option<ChannelId>,
    connected: Option<String>,
    discover_calls: usize,
    connect_calls: usize,
    disconnect_calls: usize,
}

/// Handle for a simulated connection
#[derive(Debug)]
pub struct SimHandle {
    pub device_id: String,
}

pub struct SimulatedPeripheral {
    devices: Vec<DeviceInfo>,
    channels: Vec<SimChannel>,
    /// Artificial latency for discover and connect, so cancellation can be
    /// exercised
    discover_delay: Duration,
    connect_delay: Duration,
    state: Mutex<SimState>,
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new(
            vec![
                DeviceInfo::new("SIM-00:01", Some("Wireless Mouse")),
                DeviceInfo::new("SIM-00:02", Some("Smart Speed Hub")),
                DeviceInfo::new("SIM-00:03", None),
            ],
            vec![SimChannel::new("gate-notify", true)],
        )
    }
}

impl SimulatedPeripheral {
    pub fn new(devices: Vec<DeviceInfo>, channels: Vec<SimChannel>) -> Self {
        Self {
            devices,
            channels,
            discover_delay: Duration::ZERO,
            connect_delay: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_discover_delay(mut self, delay: Duration) -> Self {
        self.discover_delay = delay;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Push a payload through the active subscription.
    /// Returns false when nothing is subscribed.
    pub fn inject(&self, payload: &[u8]) -> bool {
        let callback = self.state.lock().callback.clone();
        match callback {
            Some(callback) => {
                callback(Bytes::copy_from_slice(payload));
                true
            }
            None => {
                debug!(len = %payload.len(), "sim_inject_without_subscription");
                false
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed.is_some()
    }

    pub fn connected_device(&self) -> Option<String> {
        self.state.lock().connected.clone()
    }

    pub fn discover_calls(&self) -> usize {
        self.state.lock().discover_calls
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }
}

#[async_trait]
impl Peripheral for SimulatedPeripheral {
    type Handle = SimHandle;

    async fn discover(&self, _timeout: Duration) -> Result<Vec<DeviceInfo>, TransportError> {
        self.state.lock().discover_calls += 1;
        if !self.discover_delay.is_zero() {
            tokio::time::sleep(self.discover_delay).await;
        }
        Ok(self.devices.clone())
    }

    async fn connect(&self, device_id: &str) -> Result<SimHandle, TransportError> {
        self.state.lock().connect_calls += 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if !self.devices.iter().any(|d| d.id == device_id) {
            return Err(TransportError::new("connect", format!("no device at {device_id}")));
        }
        self.state.lock().connected = Some(device_id.to_string());
        Ok(SimHandle { device_id: device_id.to_string() })
    }

    async fn list_notifiable_channels(
        &self,
        _handle: &SimHandle,
    ) -> Result<Vec<ChannelId>, TransportError> {
        Ok(self.channels.iter().map(|c| c.id.clone()).collect())
    }

    async fn subscribe(
        &self,
        _handle: &SimHandle,
        channel: &ChannelId,
        callback: NotifyCallback,
    ) -> Result<(), TransportError> {
        let accepts = self.channels.iter().any(|c| &c.id == channel && c.accepts_subscription);
        if !accepts {
            return Err(TransportError::new("subscribe", format!("channel {channel} rejected")));
        }
        let mut state = self.state.lock();
        state.callback = Some(callback);
        state.subscribed = Some(channel.clone());
        Ok(())
    }

    async fn unsubscribe(&self, _handle: &SimHandle, channel: &ChannelId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.subscribed.as_ref() == Some(channel) {
            state.subscribed = None;
            state.callback = None;
        }
        Ok(())
    }

    async fn disconnect(&self, handle: SimHandle) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.disconnect_calls += 1;
        if state.connected.as_deref() == Some(handle.device_id.as_str()) {
            state.connected = None;
            state.callback = None;
            state.subscribed = None;
        }
        Ok(())
    }
}
