// Pluggable radio transport.
//
// The connection manager talks to the wearable through the `DeviceTransport`
// trait so its lifecycle logic can be exercised against an in-memory link in
// tests. The production implementation drives a BLE adapter via btleplug:
// scan, connect with a hard timeout, GATT subscribe, and a notification
// forwarding task feeding a bounded channel.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::DiscoveredDevice;

/// GATT characteristic carrying tagged sensor packets.
pub const SENSOR_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0013_4c4d_454d_96be_f03bac821358);
/// GATT characteristic accepting control commands.
pub const CONTROL_CHARACTERISTIC: Uuid = Uuid::from_u128(0x273e0001_4c4d_454d_96be_f03bac821358);

/// Command to begin streaming sensor data.
const CMD_START: &[u8] = b"d";
/// Command to halt streaming.
const CMD_HALT: &[u8] = b"h";

/// Events produced by an active link.
#[derive(Debug)]
pub enum LinkEvent {
    /// One raw notification payload from the sensor characteristic.
    Packet(Vec<u8>),
    /// The link dropped unexpectedly. No further events follow.
    Dropped,
}

/// An established link: identity plus the packet event stream.
pub struct DeviceLink {
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub events: mpsc::Receiver<LinkEvent>,
    pub handle: Box<dyn LinkHandle>,
}

/// Control surface of an active link.
#[async_trait]
pub trait LinkHandle: Send + Sync {
    /// Command the device to start emitting sensor packets.
    async fn start_streaming(&self) -> CoreResult<()>;
    /// Command the device to stop emitting sensor packets.
    async fn stop_streaming(&self) -> CoreResult<()>;
    /// Tear the link down.
    async fn disconnect(&self) -> CoreResult<()>;
}

/// Radio transport abstraction.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Discover nearby devices for `duration`.
    async fn scan(&self, duration: Duration) -> CoreResult<Vec<DiscoveredDevice>>;

    /// Attempt a targeted connection to `address`. Implementations should
    /// resolve the address from the adapter's current peripheral cache;
    /// the connection manager handles the fallback discovery scan.
    async fn connect(&self, address: &str, timeout: Duration) -> CoreResult<DeviceLink>;
}

/// btleplug-backed transport.
pub struct BleTransport {
    queue_depth: usize,
}

impl BleTransport {
    pub fn new(queue_depth: usize) -> Self {
        Self { queue_depth }
    }

    async fn adapter(&self) -> CoreResult<Adapter> {
        let manager = Manager::new()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        adapters
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Transport("no Bluetooth adapter found".into()))
    }

    async fn find_peripheral(
        &self,
        adapter: &Adapter,
        address: &str,
    ) -> CoreResult<Option<Peripheral>> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        for p in peripherals {
            let id = p.id().to_string();
            if id.eq_ignore_ascii_case(address) {
                return Ok(Some(p));
            }
            if let Ok(Some(props)) = p.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(Some(p));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DeviceTransport for BleTransport {
    async fn scan(&self, duration: Duration) -> CoreResult<Vec<DiscoveredDevice>> {
        let adapter = self.adapter().await?;

        info!("scan: discovering for {:.1} s", duration.as_secs_f64());
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        tokio::time::sleep(duration).await;
        adapter.stop_scan().await.ok();

        let mut found = Vec::new();
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        for p in peripherals {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    found.push(DiscoveredDevice {
                        address: props.address.to_string(),
                        name,
                        rssi: props.rssi,
                    });
                }
            }
        }
        info!("scan: {} device(s) found", found.len());
        Ok(found)
    }

    async fn connect(&self, address: &str, timeout: Duration) -> CoreResult<DeviceLink> {
        let adapter = self.adapter().await?;

        let peripheral = self
            .find_peripheral(&adapter, address)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound(address.to_string()))?;

        // BlueZ's Connect can block indefinitely when the device is out of
        // range or the stack is wedged; bound it hard.
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| CoreError::ConnectionTimeout(timeout.as_secs()))?
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        tokio::time::timeout(timeout, peripheral.discover_services())
            .await
            .map_err(|_| CoreError::ConnectionTimeout(timeout.as_secs()))?
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        let props = peripheral
            .properties()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?
            .unwrap_or_default();
        let name = props.local_name.unwrap_or_else(|| "Unknown".into());
        let rssi = props.rssi;
        info!("connected: {} ({})", name, address);

        let chars = peripheral.characteristics();
        let sensor_char = chars
            .iter()
            .find(|c| c.uuid == SENSOR_CHARACTERISTIC)
            .cloned()
            .ok_or_else(|| CoreError::Transport("sensor characteristic not found".into()))?;
        let control_char = chars
            .iter()
            .find(|c| c.uuid == CONTROL_CHARACTERISTIC)
            .cloned()
            .ok_or_else(|| CoreError::Transport("control characteristic not found".into()))?;

        peripheral
            .subscribe(&sensor_char)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<LinkEvent>(self.queue_depth);

        // Disconnect watcher: adapter events fire faster and more reliably
        // than waiting for the notification stream to close.
        let watcher_tx = tx.clone();
        let peripheral_id = peripheral.id();
        let watcher_adapter = adapter.clone();
        tokio::spawn(async move {
            match watcher_adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("link watcher: device disconnected");
                                let _ = watcher_tx.send(LinkEvent::Dropped).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("link watcher: adapter events unavailable: {}", e),
            }
        });

        // Notification forwarder.
        let forward_peripheral = peripheral.clone();
        tokio::spawn(async move {
            let mut notifications = match forward_peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("notification stream unavailable: {}", e);
                    let _ = tx.send(LinkEvent::Dropped).await;
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                if notification.uuid != SENSOR_CHARACTERISTIC {
                    debug!("ignoring notification from {}", notification.uuid);
                    continue;
                }
                if tx.send(LinkEvent::Packet(notification.value)).await.is_err() {
                    break;
                }
            }
            let _ = tx.send(LinkEvent::Dropped).await;
        });

        Ok(DeviceLink {
            address: address.to_string(),
            name,
            rssi,
            events: rx,
            handle: Box::new(BleLinkHandle {
                peripheral,
                control_char,
            }),
        })
    }
}

struct BleLinkHandle {
    peripheral: Peripheral,
    control_char: btleplug::api::Characteristic,
}

#[async_trait]
impl LinkHandle for BleLinkHandle {
    async fn start_streaming(&self) -> CoreResult<()> {
        self.peripheral
            .write(&self.control_char, CMD_START, WriteType::WithoutResponse)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    async fn stop_streaming(&self) -> CoreResult<()> {
        self.peripheral
            .write(&self.control_char, CMD_HALT, WriteType::WithoutResponse)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    async fn disconnect(&self) -> CoreResult<()> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }
}
