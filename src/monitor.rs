// Streaming health monitor.
//
// Reconciles what the caller asked for (streaming intent) with what the
// pipeline can prove (fresh samples per sensor). A grace period after every
// (re)connect keeps slow sensor bring-up from being misread as failure, and
// its expiry always forces a verdict: the monitor can sit in Initializing
// only while the grace clock runs.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::device::ConnectionManager;
use crate::hub::{BroadcastHub, Channel, Envelope, LifecycleEvent};
use crate::pipeline::AcquisitionPipeline;
use crate::types::{ConnectionState, SensorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Not streaming, or nothing to stream from.
    Idle,
    /// Streaming intended; evidence still pending within the grace period.
    Initializing,
    /// Every monitored sensor is delivering fresh data.
    Active,
    /// Grace expired with at least one monitored sensor silent.
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorHealth {
    pub kind: SensorKind,
    pub fresh: bool,
    /// Milliseconds since the last decoded sample, if any arrived.
    pub last_seen_ms: Option<u64>,
}

/// Periodic health snapshot published on the monitor channel.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub phase: StreamPhase,
    pub streaming_intended: bool,
    pub connection: ConnectionState,
    pub sensors: Vec<SensorHealth>,
    pub in_grace_period: bool,
    /// Time left on the grace clock, if one is armed. Zero once expired.
    pub grace_remaining_ms: Option<u64>,
    pub generated_at: DateTime<Utc>,
}

/// Pure phase resolution from intent and evidence.
pub fn reconcile(
    streaming_intended: bool,
    connection: &ConnectionState,
    grace_elapsed: bool,
    stale_count: usize,
) -> StreamPhase {
    if !streaming_intended {
        return StreamPhase::Idle;
    }
    match connection {
        ConnectionState::Disconnected | ConnectionState::Scanning => StreamPhase::Idle,
        // A link being (re)built is bring-up, not failure.
        ConnectionState::Connecting { .. } | ConnectionState::Reconnecting { .. } => {
            StreamPhase::Initializing
        }
        ConnectionState::Connected { .. } => {
            if stale_count == 0 {
                StreamPhase::Active
            } else if grace_elapsed {
                StreamPhase::Degraded
            } else {
                StreamPhase::Initializing
            }
        }
    }
}

pub struct StreamingMonitor {
    config: CoreConfig,
    hub: Arc<BroadcastHub>,
    manager: Arc<ConnectionManager>,
    pipeline: Arc<AcquisitionPipeline>,
    /// When the current grace period started, if one is running.
    armed_at: RwLock<Option<Instant>>,
}

impl StreamingMonitor {
    pub fn new(
        config: CoreConfig,
        hub: Arc<BroadcastHub>,
        manager: Arc<ConnectionManager>,
        pipeline: Arc<AcquisitionPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            manager,
            pipeline,
            armed_at: RwLock::new(None),
        })
    }

    /// Restart the grace clock, as on stream start or reconnect.
    pub fn arm(&self) {
        *self.armed_at.write() = Some(Instant::now());
        debug!("monitor grace period armed");
    }

    pub fn disarm(&self) {
        *self.armed_at.write() = None;
    }

    /// Assemble one status snapshot from current intent and evidence.
    pub fn evaluate(&self) -> MonitorStatus {
        let streaming_intended = self.manager.is_streaming();
        let connection = self.manager.connection_state();

        let grace_remaining = self
            .armed_at
            .read()
            .map(|armed| self.config.monitor_grace_period.saturating_sub(armed.elapsed()));
        let in_grace_period = grace_remaining.map(|left| !left.is_zero()).unwrap_or(false);

        let mut sensors = Vec::new();
        let mut stale_count = 0usize;
        for kind in self.config.monitored_sensors() {
            let last_seen = self.pipeline.last_seen(kind);
            let fresh = last_seen
                .map(|at| at.elapsed() <= self.config.staleness_window(kind))
                .unwrap_or(false);
            if !fresh {
                stale_count += 1;
            }
            sensors.push(SensorHealth {
                kind,
                fresh,
                last_seen_ms: last_seen.map(|at| at.elapsed().as_millis() as u64),
            });
        }

        let phase = reconcile(
            streaming_intended,
            &connection,
            !in_grace_period,
            stale_count,
        );

        MonitorStatus {
            phase,
            streaming_intended,
            connection,
            sensors,
            in_grace_period,
            grace_remaining_ms: grace_remaining.map(|left| left.as_millis() as u64),
            generated_at: Utc::now(),
        }
    }

    /// Run the monitor loop: fast cadence while initializing, relaxed once
    /// a verdict is in. Lifecycle events re-arm or disarm the grace clock.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let (_, mut lifecycle) = monitor.hub.subscribe(Channel::Lifecycle);
        tokio::spawn(async move {
            let mut phase = StreamPhase::Idle;
            loop {
                let cadence = if phase == StreamPhase::Initializing {
                    monitor.config.monitor_cadence_initializing
                } else {
                    monitor.config.monitor_cadence_active
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("monitor stopped");
                        break;
                    }
                    envelope = lifecycle.recv() => {
                        if let Some(Envelope::Lifecycle(event)) = envelope {
                            match event {
                                LifecycleEvent::StreamingStarted
                                | LifecycleEvent::Connected { .. } => monitor.arm(),
                                LifecycleEvent::StreamingStopped
                                | LifecycleEvent::Disconnected { expected: true, .. } => {
                                    monitor.disarm()
                                }
                                _ => {}
                            }
                        }
                    }
                    _ = tokio::time::sleep(cadence) => {
                        let status = monitor.evaluate();
                        if status.phase != phase {
                            info!("stream phase {:?} -> {:?}", phase, status.phase);
                            phase = status.phase;
                        }
                        monitor.hub.publish(Envelope::MonitorStatus(status));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimTransport;
    use crate::device::transport::DeviceTransport;

    fn connected() -> ConnectionState {
        ConnectionState::Connected {
            address: "00:11:22:33:44:55".into(),
        }
    }

    #[test]
    fn test_no_intent_is_idle() {
        assert_eq!(
            reconcile(false, &connected(), true, 3),
            StreamPhase::Idle
        );
    }

    #[test]
    fn test_intent_without_link_is_idle() {
        assert_eq!(
            reconcile(true, &ConnectionState::Disconnected, true, 3),
            StreamPhase::Idle
        );
    }

    #[test]
    fn test_reconnect_rearms_initializing() {
        let reconnecting = ConnectionState::Reconnecting {
            address: "00:11:22:33:44:55".into(),
            attempt: 2,
        };
        assert_eq!(
            reconcile(true, &reconnecting, true, 3),
            StreamPhase::Initializing
        );
    }

    #[test]
    fn test_fresh_data_promotes_to_active_even_in_grace() {
        assert_eq!(
            reconcile(true, &connected(), false, 0),
            StreamPhase::Active
        );
    }

    #[test]
    fn test_stale_within_grace_stays_initializing() {
        assert_eq!(
            reconcile(true, &connected(), false, 1),
            StreamPhase::Initializing
        );
    }

    #[test]
    fn test_grace_expiry_forces_verdict() {
        // Never stuck in Initializing: expiry resolves one way or the other.
        assert_eq!(reconcile(true, &connected(), true, 0), StreamPhase::Active);
        assert_eq!(
            reconcile(true, &connected(), true, 2),
            StreamPhase::Degraded
        );
    }

    #[tokio::test]
    async fn test_status_reports_grace_countdown() {
        let config = CoreConfig::default();
        let hub = BroadcastHub::new(8);
        let transport: std::sync::Arc<dyn DeviceTransport> =
            std::sync::Arc::new(SimTransport::new());
        let (manager, _packet_rx) =
            ConnectionManager::new(config.clone(), transport, Arc::clone(&hub));
        let pipeline = AcquisitionPipeline::new(config.clone(), Arc::clone(&hub));
        let monitor = StreamingMonitor::new(config.clone(), hub, manager, pipeline);

        assert_eq!(monitor.evaluate().grace_remaining_ms, None);

        monitor.arm();
        let status = monitor.evaluate();
        let remaining = status.grace_remaining_ms.unwrap();
        assert!(remaining <= config.monitor_grace_period.as_millis() as u64);
        assert!(remaining > 0);
        assert!(status.in_grace_period);

        monitor.disarm();
        let status = monitor.evaluate();
        assert_eq!(status.grace_remaining_ms, None);
        assert!(!status.in_grace_period);
    }
}
