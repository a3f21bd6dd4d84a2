// Device connection lifecycle.
//
// One wearable at a time. The manager serializes scan/connect attempts,
// resolves addresses with a fallback discovery scan, supervises the active
// link, and drives bounded exponential-backoff reconnects after unexpected
// drops. Raw packets are handed to the acquisition pipeline over a bounded
// channel tagged with the connection epoch.

pub mod packet;
pub mod sim;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::hub::{BroadcastHub, LifecycleEvent};
use crate::types::{ConnectionState, DeviceHandle, DiscoveredDevice};

use transport::{DeviceLink, DeviceTransport, LinkEvent, LinkHandle};

/// Depth of the manager → pipeline packet queue.
const PACKET_QUEUE_DEPTH: usize = 1024;

/// What the manager feeds the acquisition pipeline.
#[derive(Debug)]
pub enum PacketEvent {
    /// One raw notification payload.
    Data { epoch: u64, bytes: Vec<u8> },
    /// The link for `epoch` went down; buffered state should flush.
    LinkDown { epoch: u64 },
}

struct ManagerState {
    connection: ConnectionState,
    device: Option<DeviceHandle>,
    handle: Option<Arc<dyn LinkHandle>>,
    cancel: Option<CancellationToken>,
    epoch: u64,
    streaming: bool,
}

pub struct ConnectionManager {
    config: CoreConfig,
    transport: Arc<dyn DeviceTransport>,
    hub: Arc<BroadcastHub>,
    state: RwLock<ManagerState>,
    /// Serializes scan/connect; a second caller gets `ConnectionBusy`.
    busy: AtomicBool,
    packet_tx: mpsc::Sender<PacketEvent>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConnectionManager {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn DeviceTransport>,
        hub: Arc<BroadcastHub>,
    ) -> (Arc<Self>, mpsc::Receiver<PacketEvent>) {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
        let manager = Arc::new(Self {
            config,
            transport,
            hub,
            state: RwLock::new(ManagerState {
                connection: ConnectionState::Disconnected,
                device: None,
                handle: None,
                cancel: None,
                epoch: 0,
                streaming: false,
            }),
            busy: AtomicBool::new(false),
            packet_tx,
        });
        (manager, packet_rx)
    }

    fn try_busy(&self) -> CoreResult<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(BusyGuard(&self.busy))
        } else {
            Err(CoreError::ConnectionBusy)
        }
    }

    /// Discover nearby devices. Rejected while a scan or connect is in flight.
    pub async fn scan(&self) -> CoreResult<Vec<DiscoveredDevice>> {
        let _guard = self.try_busy()?;

        let was_disconnected = {
            let mut state = self.state.write();
            if state.connection == ConnectionState::Disconnected {
                state.connection = ConnectionState::Scanning;
                true
            } else {
                false
            }
        };

        self.hub.lifecycle(LifecycleEvent::ScanStarted);
        let result = self.transport.scan(self.config.scan_duration).await;

        if was_disconnected {
            let mut state = self.state.write();
            if state.connection == ConnectionState::Scanning {
                state.connection = ConnectionState::Disconnected;
            }
        }

        let devices = result?;
        self.hub.lifecycle(LifecycleEvent::ScanCompleted {
            devices: devices.clone(),
        });
        Ok(devices)
    }

    /// Connect to a device by address or advertised name.
    ///
    /// A targeted lookup runs first; if the transport does not know the
    /// identifier, a discovery scan resolves it case-insensitively against
    /// addresses and names before one retry.
    pub async fn connect(self: &Arc<Self>, target: &str) -> CoreResult<DeviceHandle> {
        let _guard = self.try_busy()?;

        if self.state.read().handle.is_some() {
            self.teardown_link(true).await;
        }

        match self.establish(target).await {
            Ok(device) => Ok(device),
            Err(CoreError::DeviceNotFound(_)) => {
                info!("connect: {} unknown, running fallback discovery", target);
                self.hub.lifecycle(LifecycleEvent::ScanStarted);
                let devices = self.transport.scan(self.config.scan_duration).await?;
                self.hub.lifecycle(LifecycleEvent::ScanCompleted {
                    devices: devices.clone(),
                });

                let resolved = devices
                    .iter()
                    .find(|d| {
                        d.address.eq_ignore_ascii_case(target)
                            || d.name.eq_ignore_ascii_case(target)
                    })
                    .map(|d| d.address.clone())
                    .ok_or_else(|| CoreError::DeviceNotFound(target.to_string()))?;

                self.establish(&resolved).await
            }
            Err(e) => Err(e),
        }
    }

    /// Open the link and install it as the active connection. The attempt
    /// itself is cancellable: a caller-initiated teardown while the
    /// transport is still connecting surfaces as `Cancelled`.
    async fn establish(self: &Arc<Self>, address: &str) -> CoreResult<DeviceHandle> {
        let cancel = CancellationToken::new();
        {
            let mut state = self.state.write();
            state.connection = ConnectionState::Connecting {
                address: address.to_string(),
            };
            state.cancel = Some(cancel.clone());
        }
        self.hub.lifecycle(LifecycleEvent::Connecting {
            address: address.to_string(),
        });

        let link = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Teardown already reset the connection state.
                return Err(CoreError::Cancelled);
            }
            result = self.transport.connect(address, self.config.connect_timeout) => {
                match result {
                    Ok(link) => link,
                    Err(e) => {
                        let mut state = self.state.write();
                        if state.handle.is_none() {
                            state.connection = ConnectionState::Disconnected;
                        }
                        return Err(e);
                    }
                }
            }
        };

        let DeviceLink {
            address,
            name,
            rssi,
            events,
            handle,
        } = link;
        let handle: Arc<dyn LinkHandle> = Arc::from(handle);

        let device = {
            let mut state = self.state.write();
            state.epoch += 1;
            let device = DeviceHandle {
                address: address.clone(),
                name,
                state: ConnectionState::Connected {
                    address: address.clone(),
                },
                battery_percent: None,
                rssi,
                connected_at: Utc::now(),
                epoch: state.epoch,
            };
            state.connection = ConnectionState::Connected { address };
            state.device = Some(device.clone());
            state.handle = Some(Arc::clone(&handle));
            state.cancel = Some(cancel.clone());
            device
        };

        self.hub.lifecycle(LifecycleEvent::Connected {
            device: device.clone(),
        });
        self.spawn_link_reader(events, device.epoch, cancel);
        Ok(device)
    }

    fn spawn_link_reader(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = manager.packet_tx.try_send(PacketEvent::LinkDown { epoch });
                        debug!("link reader for epoch {} cancelled", epoch);
                        break;
                    }
                    event = events.recv() => match event {
                        Some(LinkEvent::Packet(bytes)) => {
                            if manager
                                .packet_tx
                                .try_send(PacketEvent::Data { epoch, bytes })
                                .is_err()
                            {
                                debug!("pipeline queue full, packet dropped");
                            }
                        }
                        Some(LinkEvent::Dropped) | None => {
                            let _ = manager.packet_tx.try_send(PacketEvent::LinkDown { epoch });
                            manager.handle_link_drop(epoch).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Unexpected drop: surface the event and start the reconnect loop.
    async fn handle_link_drop(self: &Arc<Self>, epoch: u64) {
        let (address, cancel) = {
            let mut state = self.state.write();
            if state.epoch != epoch {
                // A newer link superseded this one.
                return;
            }
            state.handle = None;
            let address = state
                .device
                .as_ref()
                .map(|d| d.address.clone())
                .unwrap_or_default();
            let cancel = state.cancel.clone();
            (address, cancel)
        };

        warn!("link to {} dropped unexpectedly", address);
        self.hub.lifecycle(LifecycleEvent::Disconnected {
            address: address.clone(),
            expected: false,
        });

        if !self.config.auto_reconnect {
            let mut state = self.state.write();
            state.connection = ConnectionState::Disconnected;
            state.device = None;
            state.streaming = false;
            return;
        }

        let cancel = cancel.unwrap_or_default();
        self.reconnect_loop(address, cancel, epoch).await;
    }

    async fn reconnect_loop(
        self: &Arc<Self>,
        address: String,
        cancel: CancellationToken,
        dropped_epoch: u64,
    ) {
        let was_streaming = self.state.read().streaming;

        for attempt in 1..=self.config.max_reconnect_attempts {
            let delay = self.config.reconnect_backoff_base * 2u32.pow(attempt - 1);
            {
                let mut state = self.state.write();
                state.connection = ConnectionState::Reconnecting {
                    address: address.clone(),
                    attempt,
                };
            }
            self.hub.lifecycle(LifecycleEvent::Reconnecting {
                address: address.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect to {} cancelled", address);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // Each attempt holds the busy slot so it cannot interleave with
            // a caller-initiated scan or connect; losing the race means the
            // caller took over and this loop is obsolete.
            let _guard = match self.try_busy() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("reconnect to {} superseded by caller operation", address);
                    return;
                }
            };
            {
                let state = self.state.read();
                if state.epoch != dropped_epoch
                    || state.connection == ConnectionState::Disconnected
                {
                    debug!("reconnect to {} no longer applicable", address);
                    return;
                }
            }

            match self.establish(&address).await {
                Ok(device) => {
                    info!(
                        "reconnected to {} on attempt {} (epoch {})",
                        address, attempt, device.epoch
                    );
                    if was_streaming {
                        let handle = self.state.read().handle.clone();
                        if let Some(handle) = handle {
                            if let Err(e) = handle.start_streaming().await {
                                warn!("failed to resume streaming after reconnect: {}", e);
                            }
                        }
                    }
                    return;
                }
                Err(CoreError::Cancelled) => {
                    debug!("reconnect to {} cancelled mid-attempt", address);
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt {} to {} failed: {}", attempt, address, e);
                }
            }
        }

        error!(
            "giving up on {} after {} reconnect attempts",
            address, self.config.max_reconnect_attempts
        );
        {
            let mut state = self.state.write();
            state.connection = ConnectionState::Disconnected;
            state.device = None;
            state.streaming = false;
        }
        self.hub.lifecycle(LifecycleEvent::ConnectionFailed {
            address,
            reason: format!(
                "exhausted {} reconnect attempts",
                self.config.max_reconnect_attempts
            ),
        });
    }

    /// Caller-initiated disconnect.
    pub async fn disconnect(&self) -> CoreResult<()> {
        if self.state.read().connection == ConnectionState::Disconnected {
            return Err(CoreError::NotConnected);
        }
        self.teardown_link(true).await;
        Ok(())
    }

    async fn teardown_link(&self, expected: bool) {
        let (handle, cancel, address) = {
            let mut state = self.state.write();
            let handle = state.handle.take();
            let cancel = state.cancel.take();
            let address = state
                .device
                .as_ref()
                .map(|d| d.address.clone())
                .unwrap_or_default();
            state.connection = ConnectionState::Disconnected;
            state.device = None;
            state.streaming = false;
            (handle, cancel, address)
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            if let Err(e) = handle.disconnect().await {
                warn!("disconnect from {} failed: {}", address, e);
            }
        }
        self.hub.lifecycle(LifecycleEvent::Disconnected {
            address,
            expected,
        });
    }

    /// Command the device to start emitting sensor packets.
    pub async fn start_streaming(&self) -> CoreResult<()> {
        let handle = {
            let state = self.state.read();
            if !matches!(state.connection, ConnectionState::Connected { .. }) {
                return Err(CoreError::NotConnected);
            }
            if state.streaming {
                return Err(CoreError::AlreadyStreaming);
            }
            state.handle.clone().ok_or(CoreError::NotConnected)?
        };
        handle.start_streaming().await?;
        self.state.write().streaming = true;
        self.hub.lifecycle(LifecycleEvent::StreamingStarted);
        Ok(())
    }

    /// Command the device to stop emitting sensor packets.
    pub async fn stop_streaming(&self) -> CoreResult<()> {
        let handle = {
            let state = self.state.read();
            if !state.streaming {
                return Err(CoreError::NotStreaming);
            }
            state.handle.clone().ok_or(CoreError::NotConnected)?
        };
        handle.stop_streaming().await?;
        self.state.write().streaming = false;
        self.hub.lifecycle(LifecycleEvent::StreamingStopped);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.state.read().streaming
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection.clone()
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.state.read().device.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Record the latest battery reading on the device handle.
    pub fn set_battery(&self, percent: f64) {
        let mut state = self.state.write();
        if let Some(device) = state.device.as_mut() {
            device.battery_percent = Some(percent);
        }
        drop(state);
        self.hub
            .lifecycle(LifecycleEvent::BatteryUpdated { percent });
    }
}
