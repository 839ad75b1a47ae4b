//! Connection supervisor - owns the peripheral connection lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`
//!
//! Scan and connect suspend on the transport while the caller keeps full use
//! of the engine. A `disconnect()` that lands while either is in flight bumps
//! the epoch. The in-flight call finishes, sees the stale epoch under the state
//! lock and returns [`ConnectionError::Cancelled`] without committing. A stale
//! handle is released unless a newer connect already owns the same device.
//!
//! Payload bytes are never inspected here, they go straight to
//! [`EngineHandle::deliver`].

use crate::domain::errors::ConnectionError;
use crate::domain::types::{ChannelId, ConnectionState, PeripheralConnection};
use crate::io::peripheral::{DeviceInfo, NotifyCallback, Peripheral};
use crate::services::engine::{EngineEvent, EngineHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Order devices so keyword matches come first, discovery order otherwise
pub fn rank_devices(devices: Vec<DeviceInfo>, keywords: &[String]) -> Vec<DeviceInfo> {
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let mut ranked = devices;
    // sort_by_key is stable
    ranked.sort_by_key(|device| {
        let name = device.name.as_deref().unwrap_or_default().to_lowercase();
        !keywords.iter().any(|k| !k.is_empty() && name.contains(k.as_str()))
    });
    ranked
}

struct SupervisorState<H> {
    connection: PeripheralConnection,
    handle: Option<H>,
    /// Device being connected or held
    device_id: Option<String>,
    /// Result of the last completed scan
    candidates: Vec<DeviceInfo>,
    /// Bumped by every `disconnect()`. Checked and committed under the same
    /// guard as the rest of the state.
    epoch: u64,
}

pub struct ConnectionSupervisor<P: Peripheral> {
    peripheral: Arc<P>,
    engine: EngineHandle,
    keywords: Vec<String>,
    scan_timeout: Duration,
    state: Mutex<SupervisorState<P::Handle>>,
}

impl<P: Peripheral> ConnectionSupervisor<P> {
    pub fn new(
        peripheral: Arc<P>,
        engine: EngineHandle,
        keywords: Vec<String>,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            peripheral,
            engine,
            keywords,
            scan_timeout,
            state: Mutex::new(SupervisorState {
                connection: PeripheralConnection::default(),
                handle: None,
                device_id: None,
                candidates: Vec::new(),
                epoch: 0,
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection.state
    }

    pub fn connection(&self) -> PeripheralConnection {
        self.state.lock().connection.clone()
    }

    pub fn candidates(&self) -> Vec<DeviceInfo> {
        self.state.lock().candidates.clone()
    }

    /// Discover nearby devices, ranked by name keywords
    pub async fn scan(&self) -> Result<Vec<DeviceInfo>, ConnectionError> {
        let epoch = self.state.lock().epoch;
        info!(timeout_secs = %self.scan_timeout.as_secs(), "ble_scan_started");

        let devices = self.peripheral.discover(self.scan_timeout).await?;
        let ranked = rank_devices(devices, &self.keywords);

        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!("ble_scan_cancelled");
            return Err(ConnectionError::Cancelled);
        }
        state.candidates = ranked.clone();
        info!(devices = %ranked.len(), "ble_scan_completed");
        Ok(ranked)
    }

    /// Connect to a device from the last scan and subscribe to its first
    /// channel that accepts notifications
    pub async fn connect(&self, device_id: &str) -> Result<ChannelId, ConnectionError> {
        let epoch = {
            let mut state = self.state.lock();
            match state.connection.state {
                ConnectionState::Connecting => return Err(ConnectionError::AlreadyConnecting),
                ConnectionState::Connected => return Err(ConnectionError::AlreadyConnected),
                ConnectionState::Disconnected => {}
            }
            if !state.candidates.iter().any(|d| d.id == device_id) {
                return Err(ConnectionError::DeviceNotFound(device_id.to_string()));
            }
            state.connection.state = ConnectionState::Connecting;
            state.device_id = Some(device_id.to_string());
            // Published under the guard so observers see transitions in order
            self.publish_state(ConnectionState::Connecting);
            state.epoch
        };
        info!(device_id = %device_id, "ble_connecting");

        let result = self.establish(device_id).await;

        let device_in_use = {
            let mut state = self.state.lock();
            if state.epoch == epoch {
                return self.commit(&mut state, device_id, result);
            }
            // A newer connect may hold the same device; releasing would tear
            // down its link too
            state.device_id.as_deref() == Some(device_id)
        };

        if let Ok((handle, channel)) = result {
            if device_in_use {
                debug!(device_id = %device_id, "ble_stale_handle_dropped");
                drop(handle);
            } else {
                self.release(handle, Some(&channel)).await;
            }
        }
        info!(device_id = %device_id, "ble_connect_cancelled");
        Err(ConnectionError::Cancelled)
    }

    /// Apply a connect result for the current epoch. Runs under the state lock.
    fn commit(
        &self,
        state: &mut SupervisorState<P::Handle>,
        device_id: &str,
        result: Result<(P::Handle, ChannelId), ConnectionError>,
    ) -> Result<ChannelId, ConnectionError> {
        match result {
            Ok((handle, channel)) => {
                state.connection =
                    PeripheralConnection { state: ConnectionState::Connected, channel: Some(channel.clone()) };
                state.handle = Some(handle);
                self.publish_state(ConnectionState::Connected);
                info!(device_id = %device_id, channel = %channel, "ble_connected");
                Ok(channel)
            }
            Err(e) => {
                state.connection = PeripheralConnection::default();
                state.device_id = None;
                self.publish_state(ConnectionState::Disconnected);
                warn!(device_id = %device_id, error = %e, "ble_connect_failed");
                Err(e)
            }
        }
    }

    /// Drop the connection and cancel any in-flight scan or connect.
    /// Safe to call in any state.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let (previous, handle, channel) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.device_id = None;
            let previous = std::mem::take(&mut state.connection);
            if previous.state != ConnectionState::Disconnected {
                self.publish_state(ConnectionState::Disconnected);
            }
            (previous.state, state.handle.take(), previous.channel)
        };

        if let Some(handle) = handle {
            self.release(handle, channel.as_ref()).await;
        }

        if previous != ConnectionState::Disconnected {
            info!(previous = %previous.as_str(), "ble_disconnected");
        }
        Ok(())
    }

    async fn establish(&self, device_id: &str) -> Result<(P::Handle, ChannelId), ConnectionError> {
        let handle = self.peripheral.connect(device_id).await?;

        let channels = match self.peripheral.list_notifiable_channels(&handle).await {
            Ok(channels) => channels,
            Err(e) => {
                self.release(handle, None).await;
                return Err(e.into());
            }
        };

        let callback = self.delivery_callback();
        for channel in channels {
            match self.peripheral.subscribe(&handle, &channel, callback.clone()).await {
                Ok(()) => return Ok((handle, channel)),
                Err(e) => debug!(channel = %channel, error = %e, "ble_subscribe_rejected"),
            }
        }

        self.release(handle, None).await;
        Err(ConnectionError::NoNotifiableChannel)
    }

    /// Unsubscribe (when subscribed) and drop the handle, logging failures
    async fn release(&self, handle: P::Handle, channel: Option<&ChannelId>) {
        if let Some(channel) = channel {
            if let Err(e) = self.peripheral.unsubscribe(&handle, channel).await {
                warn!(channel = %channel, error = %e, "ble_unsubscribe_failed");
            }
        }
        if let Err(e) = self.peripheral.disconnect(handle).await {
            warn!(error = %e, "ble_release_failed");
        }
    }

    fn delivery_callback(&self) -> NotifyCallback {
        let engine = self.engine.clone();
        Arc::new(move |payload| engine.deliver(payload))
    }

    fn publish_state(&self, state: ConnectionState) {
        self.engine.publish(EngineEvent::ConnectionStateChanged(state));
    }
}
