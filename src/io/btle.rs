//! btleplug backed peripheral (feature `ble`)
//!
//! Channel ids are characteristic UUIDs in hyphenated form. One notification
//! pump task per subscription forwards matching values to the callback.

use crate::domain::errors::TransportError;
use crate::domain::types::ChannelId;
use crate::io::peripheral::{DeviceInfo, NotifyCallback, Peripheral};
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on BlueZ calls that can otherwise block indefinitely
const GATT_TIMEOUT: Duration = Duration::from_secs(15);

fn transport(operation: &'static str) -> impl Fn(btleplug::Error) -> TransportError {
    move |e| TransportError::new(operation, e.to_string())
}

async fn with_timeout<T>(
    operation: &'static str,
    fut: impl std::future::Future<Output = Result<T, btleplug::Error>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(GATT_TIMEOUT, fut)
        .await
        .map_err(|_| TransportError::new(operation, "timed out"))?
        .map_err(transport(operation))
}

pub struct BtleHandle {
    peripheral: PlatformPeripheral,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleHandle {
    fn find_characteristic(&self, channel: &ChannelId) -> Result<Characteristic, TransportError> {
        let uuid = Uuid::parse_str(&channel.0)
            .map_err(|e| TransportError::new("subscribe", format!("bad channel id: {e}")))?;
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::new("subscribe", format!("no characteristic {uuid}")))
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

// A dropped handle must not leave its pump forwarding payloads
impl Drop for BtleHandle {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

pub struct BtlePeripheral {
    adapter: Adapter,
    /// Peripherals seen by the last discovery, by id
    seen: Mutex<HashMap<String, PlatformPeripheral>>,
}

impl BtlePeripheral {
    /// Open the first available adapter
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(transport("manager"))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport("adapters"))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new("adapters", "no Bluetooth adapter found"))?;
        info!("ble_adapter_ready");
        Ok(Self { adapter, seen: Mutex::new(HashMap::new()) })
    }
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    type Handle = BtleHandle;

    async fn discover(&self, timeout: Duration) -> Result<Vec<DeviceInfo>, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await.map_err(transport("scan"))?;
        tokio::time::sleep(timeout).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!(error = %e, "ble_stop_scan_failed");
        }

        let peripherals = self.adapter.peripherals().await.map_err(transport("scan"))?;
        let mut devices = Vec::with_capacity(peripherals.len());
        let mut seen = HashMap::with_capacity(peripherals.len());
        for p in peripherals {
            let id = p.id().to_string();
            let name = match p.properties().await {
                Ok(Some(props)) => props.local_name,
                _ => None,
            };
            devices.push(DeviceInfo { id: id.clone(), name });
            seen.insert(id, p);
        }
        *self.seen.lock() = seen;
        Ok(devices)
    }

    async fn connect(&self, device_id: &str) -> Result<BtleHandle, TransportError> {
        let peripheral = self
            .seen
            .lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| TransportError::new("connect", format!("{device_id} not discovered")))?;

        with_timeout("connect", peripheral.connect()).await?;
        Ok(BtleHandle { peripheral, pump: Mutex::new(None) })
    }

    async fn list_notifiable_channels(
        &self,
        handle: &BtleHandle,
    ) -> Result<Vec<ChannelId>, TransportError> {
        with_timeout("discover_services", handle.peripheral.discover_services()).await?;
        let channels = handle
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE))
            .map(|c| ChannelId(c.uuid.to_string()))
            .collect();
        Ok(channels)
    }

    async fn subscribe(
        &self,
        handle: &BtleHandle,
        channel: &ChannelId,
        callback: NotifyCallback,
    ) -> Result<(), TransportError> {
        let characteristic = handle.find_characteristic(channel)?;
        with_timeout("subscribe", handle.peripheral.subscribe(&characteristic)).await?;

        let mut notifications =
            handle.peripheral.notifications().await.map_err(transport("notifications"))?;
        let uuid = characteristic.uuid;
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    callback(Bytes::from(notification.value));
                }
            }
            debug!(channel = %uuid, "ble_notification_stream_ended");
        });

        handle.stop_pump();
        *handle.pump.lock() = Some(pump);
        Ok(())
    }

    async fn unsubscribe(&self, handle: &BtleHandle, channel: &ChannelId) -> Result<(), TransportError> {
        handle.stop_pump();
        let characteristic = handle.find_characteristic(channel)?;
        with_timeout("unsubscribe", handle.peripheral.unsubscribe(&characteristic)).await
    }

    async fn disconnect(&self, handle: BtleHandle) -> Result<(), TransportError> {
        handle.stop_pump();
        with_timeout("disconnect", handle.peripheral.disconnect()).await
    }
}
