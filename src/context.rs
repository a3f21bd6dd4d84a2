// Application context: wires the subsystems together and exposes the
// control-plane commands callers drive the core with.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::device::sim::SimTransport;
use crate::device::transport::{BleTransport, DeviceTransport};
use crate::device::ConnectionManager;
use crate::error::CoreResult;
use crate::hub::{BroadcastHub, Channel, Envelope, LifecycleEvent};
use crate::monitor::{MonitorStatus, StreamPhase, StreamingMonitor};
use crate::pipeline::{AcquisitionPipeline, SensorSnapshot};
use crate::processing;
use crate::recording::{RecordingFormat, RecordingManager, SessionInfo, SessionManifest};
use crate::telemetry::{
    Severity, StoredRecord, SummaryRow, TelemetryQuery, TelemetryRecord, TelemetryService,
    TelemetryStore,
};
use crate::types::{ConnectionState, DeviceHandle, DiscoveredDevice, SensorKind};

/// Aggregated status snapshot for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub connection: ConnectionState,
    pub device: Option<DeviceHandle>,
    pub streaming: bool,
    pub monitor: MonitorStatus,
    pub sensors: Vec<SensorSnapshot>,
    pub recording: Option<SessionInfo>,
    pub telemetry_dropped: u64,
}

pub struct AppContext {
    pub config: CoreConfig,
    pub hub: Arc<BroadcastHub>,
    pub manager: Arc<ConnectionManager>,
    pub pipeline: Arc<AcquisitionPipeline>,
    pub monitor: Arc<StreamingMonitor>,
    pub recorder: Arc<RecordingManager>,
    pub telemetry: Arc<TelemetryService>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    /// Build against the BLE radio.
    pub fn build(config: CoreConfig) -> CoreResult<Arc<Self>> {
        let transport = Arc::new(BleTransport::new(config.hub_queue_depth));
        Self::build_with_transport(config, transport)
    }

    /// Build against the packet simulator (no hardware required).
    pub fn build_simulated(config: CoreConfig) -> CoreResult<Arc<Self>> {
        Self::build_with_transport(config, Arc::new(SimTransport::new()))
    }

    pub fn build_with_transport(
        config: CoreConfig,
        transport: Arc<dyn DeviceTransport>,
    ) -> CoreResult<Arc<Self>> {
        let cancel = CancellationToken::new();
        let hub = BroadcastHub::new(config.hub_queue_depth);
        let mut tasks = Vec::new();

        let (manager, packet_rx) =
            ConnectionManager::new(config.clone(), transport, Arc::clone(&hub));

        let pipeline = AcquisitionPipeline::new(config.clone(), Arc::clone(&hub));
        tasks.push(pipeline.spawn(packet_rx, cancel.child_token()));

        tasks.push(processing::spawn(Arc::clone(&hub), cancel.child_token()));

        let monitor = StreamingMonitor::new(
            config.clone(),
            Arc::clone(&hub),
            Arc::clone(&manager),
            Arc::clone(&pipeline),
        );
        tasks.push(monitor.spawn(cancel.child_token()));

        let store = Arc::new(TelemetryStore::open(&config.telemetry_db_path)?);
        let (telemetry, telemetry_task) =
            TelemetryService::spawn(&config, store, Arc::clone(&hub), cancel.child_token());
        tasks.push(telemetry_task);

        let recorder = RecordingManager::new(config.clone(), Arc::clone(&hub));

        tasks.push(spawn_event_bridge(
            Arc::clone(&hub),
            Arc::clone(&manager),
            Arc::clone(&telemetry),
            cancel.child_token(),
        ));

        Ok(Arc::new(Self {
            config,
            hub,
            manager,
            pipeline,
            monitor,
            recorder,
            telemetry,
            cancel,
            tasks: Mutex::new(tasks),
        }))
    }

    pub async fn scan_devices(&self) -> CoreResult<Vec<DiscoveredDevice>> {
        self.manager.scan().await
    }

    pub async fn connect_device(&self, target: &str) -> CoreResult<DeviceHandle> {
        let started = std::time::Instant::now();
        let handle = self.manager.connect(target).await?;
        self.telemetry.record(TelemetryRecord::performance(
            "connection",
            "connect",
            started.elapsed().as_secs_f64() * 1000.0,
        ));
        Ok(handle)
    }

    pub async fn disconnect_device(&self) -> CoreResult<()> {
        self.manager.disconnect().await
    }

    pub async fn start_streaming(&self) -> CoreResult<()> {
        self.manager.start_streaming().await
    }

    pub async fn stop_streaming(&self) -> CoreResult<()> {
        self.manager.stop_streaming().await
    }

    pub fn start_recording(
        &self,
        label: Option<String>,
        format: RecordingFormat,
        destination: Option<std::path::PathBuf>,
    ) -> CoreResult<SessionInfo> {
        self.recorder
            .start(label, format, destination, self.manager.device())
    }

    pub async fn stop_recording(&self) -> CoreResult<SessionManifest> {
        self.recorder.stop().await
    }

    pub fn status(&self) -> CoreStatus {
        CoreStatus {
            connection: self.manager.connection_state(),
            device: self.manager.device(),
            streaming: self.manager.is_streaming(),
            monitor: self.monitor.evaluate(),
            sensors: self.pipeline.snapshot(),
            recording: self.recorder.current(),
            telemetry_dropped: self.telemetry.dropped(),
        }
    }

    pub fn query_telemetry(&self, filter: &TelemetryQuery) -> CoreResult<Vec<StoredRecord>> {
        self.telemetry.store().query(filter)
    }

    pub fn summarize_telemetry(&self) -> CoreResult<Vec<SummaryRow>> {
        self.telemetry.store().summarize()
    }

    /// Orderly teardown: close any recording, drop the link, stop tasks.
    pub async fn shutdown(&self) {
        info!("core shutting down");
        if self.recorder.current().is_some() {
            if let Err(e) = self.recorder.stop().await {
                warn!("stopping recording during shutdown failed: {}", e);
            }
        }
        if self.manager.connection_state() != ConnectionState::Disconnected {
            if let Err(e) = self.manager.disconnect().await {
                warn!("disconnect during shutdown failed: {}", e);
            }
        }
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Bridges hub traffic into durable telemetry and housekeeping updates:
/// lifecycle events and monitor phase changes become telemetry records, and
/// battery batches refresh the device handle.
fn spawn_event_bridge(
    hub: Arc<BroadcastHub>,
    manager: Arc<ConnectionManager>,
    telemetry: Arc<TelemetryService>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (_, mut lifecycle_rx) = hub.subscribe(Channel::Lifecycle);
    let (_, mut monitor_rx) = hub.subscribe(Channel::MonitorStatus);
    let (_, mut raw_rx) = hub.subscribe(Channel::RawData);

    tokio::spawn(async move {
        let mut last_phase: Option<StreamPhase> = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = lifecycle_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Envelope::Lifecycle(event) = envelope {
                        telemetry.record(lifecycle_to_record(&event));
                    }
                }
                envelope = monitor_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Envelope::MonitorStatus(status) = envelope {
                        if last_phase != Some(status.phase) {
                            last_phase = Some(status.phase);
                            let severity = match status.phase {
                                StreamPhase::Degraded => Severity::Warning,
                                _ => Severity::Info,
                            };
                            telemetry.record(
                                TelemetryRecord::new(
                                    severity,
                                    "monitor",
                                    format!("stream phase changed to {:?}", status.phase),
                                )
                                .with_payload(serde_json::json!({
                                    "phase": status.phase,
                                    "in_grace_period": status.in_grace_period,
                                })),
                            );
                        }
                    }
                }
                envelope = raw_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Envelope::RawData(batch) = envelope {
                        if batch.kind == SensorKind::Battery {
                            if let Some(level) = batch
                                .samples
                                .last()
                                .and_then(|s| s.channels.first().copied())
                            {
                                manager.set_battery(level);
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Battery levels and terminal connection failures get typed bodies so they
/// can be queried by kind; everything else is a plain log line.
fn lifecycle_to_record(event: &LifecycleEvent) -> TelemetryRecord {
    match event {
        LifecycleEvent::BatteryUpdated { percent } => {
            return TelemetryRecord::metric("battery", "battery_level", *percent, Some("%"));
        }
        LifecycleEvent::ConnectionFailed { address, reason } => {
            return TelemetryRecord::alert(
                Severity::Error,
                "lifecycle",
                address,
                format!("connection to {address} failed: {reason}"),
            )
            .with_payload(serde_json::to_value(event).unwrap_or(serde_json::Value::Null));
        }
        _ => {}
    }

    let (severity, message) = match event {
        LifecycleEvent::ScanStarted => (Severity::Debug, "scan started".to_string()),
        LifecycleEvent::ScanCompleted { devices } => (
            Severity::Debug,
            format!("scan completed: {} device(s)", devices.len()),
        ),
        LifecycleEvent::Connecting { address } => {
            (Severity::Info, format!("connecting to {address}"))
        }
        LifecycleEvent::Connected { device } => (
            Severity::Info,
            format!("connected to {} ({})", device.name, device.address),
        ),
        LifecycleEvent::Disconnected {
            address,
            expected: true,
        } => (Severity::Info, format!("disconnected from {address}")),
        LifecycleEvent::Disconnected { address, .. } => (
            Severity::Warning,
            format!("link to {address} dropped unexpectedly"),
        ),
        LifecycleEvent::Reconnecting {
            address, attempt, ..
        } => (
            Severity::Warning,
            format!("reconnect attempt {attempt} to {address}"),
        ),
        LifecycleEvent::StreamingStarted => (Severity::Info, "streaming started".to_string()),
        LifecycleEvent::StreamingStopped => (Severity::Info, "streaming stopped".to_string()),
        LifecycleEvent::ConnectionFailed { .. } | LifecycleEvent::BatteryUpdated { .. } => {
            unreachable!("handled above")
        }
        LifecycleEvent::RecordingStarted { session_id } => (
            Severity::Info,
            format!("recording session {session_id} started"),
        ),
        LifecycleEvent::RecordingStopped { session_id } => (
            Severity::Info,
            format!("recording session {session_id} stopped"),
        ),
    };
    TelemetryRecord::new(severity, "lifecycle", message)
        .with_payload(serde_json::to_value(event).unwrap_or(serde_json::Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(dir: &tempfile::TempDir) -> CoreConfig {
        CoreConfig {
            telemetry_db_path: dir.path().join("telemetry.db"),
            recording_directory: dir.path().join("recordings"),
            telemetry_flush_interval: Duration::from_millis(50),
            monitor_cadence_initializing: Duration::from_millis(20),
            monitor_cadence_active: Duration::from_millis(50),
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_full_stack_against_simulator() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::build_simulated(test_config(&dir)).unwrap();

        let devices = ctx.scan_devices().await.unwrap();
        assert_eq!(devices[0].name, "SimBand");

        ctx.connect_device("SimBand").await.unwrap();
        ctx.start_streaming().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let status = ctx.status();
        assert!(status.streaming);
        assert!(matches!(
            status.connection,
            ConnectionState::Connected { .. }
        ));
        let total_samples: u64 = status.sensors.iter().map(|s| s.samples).sum();
        assert!(total_samples > 0);

        ctx.shutdown().await;
    }

    #[test]
    fn test_battery_and_failure_events_get_typed_bodies() {
        use crate::telemetry::TelemetryBody;

        let record = lifecycle_to_record(&LifecycleEvent::BatteryUpdated { percent: 76.0 });
        assert_eq!(record.category, "battery");
        assert!(matches!(
            record.body,
            TelemetryBody::Metric { value, .. } if value == 76.0
        ));

        let record = lifecycle_to_record(&LifecycleEvent::ConnectionFailed {
            address: "00:11:22:33:44:55".into(),
            reason: "out of range".into(),
        });
        assert!(matches!(record.severity, Severity::Error));
        assert!(matches!(
            record.body,
            TelemetryBody::Alert { ref source } if source == "00:11:22:33:44:55"
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_events_become_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::build_simulated(test_config(&dir)).unwrap();

        ctx.connect_device("SimBand").await.unwrap();
        ctx.disconnect_device().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let rows = ctx
            .query_telemetry(&TelemetryQuery {
                category: Some("lifecycle".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(rows
            .iter()
            .any(|r| r.record.message.contains("connected to SimBand")));

        ctx.shutdown().await;
    }
}
