// In-process broadcast hub.
//
// Producers publish envelopes onto named channels; subscribers receive them
// over bounded queues. Delivery is best-effort and never blocks a producer:
// a full subscriber queue drops the envelope for that subscriber only, and
// a closed queue gets the subscriber pruned on the next publish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::monitor::MonitorStatus;
use crate::telemetry::TelemetryRecord;
use crate::types::{DeviceHandle, DiscoveredDevice, ProcessedSample, SampleBatch};

/// Named fan-out channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Lifecycle,
    RawData,
    ProcessedData,
    MonitorStatus,
    Telemetry,
}

/// Connection and session lifecycle notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ScanStarted,
    ScanCompleted {
        devices: Vec<DiscoveredDevice>,
    },
    Connecting {
        address: String,
    },
    Connected {
        device: DeviceHandle,
    },
    Disconnected {
        address: String,
        /// True when the caller asked for the disconnect.
        expected: bool,
    },
    Reconnecting {
        address: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Reconnect attempts are exhausted; manual intervention required.
    ConnectionFailed {
        address: String,
        reason: String,
    },
    StreamingStarted,
    StreamingStopped,
    BatteryUpdated {
        percent: f64,
    },
    RecordingStarted {
        session_id: String,
    },
    RecordingStopped {
        session_id: String,
    },
}

/// One published message. Bulk payloads travel behind `Arc` so fan-out to
/// many subscribers stays cheap.
#[derive(Debug, Clone)]
pub enum Envelope {
    Lifecycle(LifecycleEvent),
    RawData(Arc<SampleBatch>),
    ProcessedData(Arc<ProcessedSample>),
    MonitorStatus(MonitorStatus),
    Telemetry(TelemetryRecord),
}

impl Envelope {
    pub fn channel(&self) -> Channel {
        match self {
            Envelope::Lifecycle(_) => Channel::Lifecycle,
            Envelope::RawData(_) => Channel::RawData,
            Envelope::ProcessedData(_) => Channel::ProcessedData,
            Envelope::MonitorStatus(_) => Channel::MonitorStatus,
            Envelope::Telemetry(_) => Channel::Telemetry,
        }
    }
}

/// Handle for a hub subscription, used to unsubscribe explicitly.
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Envelope>,
}

/// Per-channel delivery counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ChannelStats {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

/// Fan-out registry. Cheap to clone via `Arc`.
pub struct BroadcastHub {
    subscribers: RwLock<HashMap<Channel, Vec<Subscriber>>>,
    next_id: AtomicU64,
    default_depth: usize,
    published: RwLock<HashMap<Channel, u64>>,
    dropped: RwLock<HashMap<Channel, u64>>,
}

impl BroadcastHub {
    pub fn new(default_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            default_depth,
            published: RwLock::new(HashMap::new()),
            dropped: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to one channel with the hub's default queue depth. The
    /// registration is in place when this returns.
    pub fn subscribe(&self, channel: Channel) -> (SubscriberId, mpsc::Receiver<Envelope>) {
        self.subscribe_with_depth(channel, self.default_depth)
    }

    /// Subscribe with an explicit queue depth. Slow consumers lose envelopes
    /// once their queue fills; they never slow the producer down.
    pub fn subscribe_with_depth(
        &self,
        channel: Channel,
        depth: usize,
    ) -> (SubscriberId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(channel)
            .or_default()
            .push(Subscriber { id, tx });
        debug!("hub: subscriber {} joined {:?}", id, channel);
        (id, rx)
    }

    /// Remove one subscriber from a channel. Its receiver drains whatever
    /// is already queued and then reports the stream closed. Returns false
    /// if the id was not subscribed (e.g. already pruned).
    pub fn unsubscribe(&self, channel: Channel, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&channel) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() < before;
        if removed {
            debug!("hub: subscriber {} left {:?}", id, channel);
        }
        removed
    }

    /// Publish one envelope to its channel. Never blocks.
    pub fn publish(&self, envelope: Envelope) {
        let channel = envelope.channel();
        *self.published.write().entry(channel).or_insert(0) += 1;

        let mut closed: Vec<u64> = Vec::new();
        {
            let subscribers = self.subscribers.read();
            let Some(list) = subscribers.get(&channel) else {
                return;
            };
            for sub in list {
                match sub.tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let mut dropped = self.dropped.write();
                        let count = dropped.entry(channel).or_insert(0);
                        *count += 1;
                        if *count % 1000 == 0 {
                            warn!("hub: {} envelopes dropped on {:?} so far", count, channel);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(sub.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            if let Some(list) = subscribers.get_mut(&channel) {
                list.retain(|s| !closed.contains(&s.id));
            }
            debug!(
                "hub: pruned {} closed subscriber(s) from {:?}",
                closed.len(),
                channel
            );
        }
    }

    pub fn lifecycle(&self, event: LifecycleEvent) {
        self.publish(Envelope::Lifecycle(event));
    }

    /// Delivery counters for one channel.
    pub fn stats(&self, channel: Channel) -> ChannelStats {
        let published = self.published.read().get(&channel).copied().unwrap_or(0);
        let dropped = self.dropped.read().get(&channel).copied().unwrap_or(0);
        let subscribers = self
            .subscribers
            .read()
            .get(&channel)
            .map(|l| l.len())
            .unwrap_or(0);
        ChannelStats {
            published,
            dropped,
            subscribers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlushReason, SensorKind};
    use chrono::Utc;

    fn batch() -> Arc<SampleBatch> {
        Arc::new(SampleBatch {
            kind: SensorKind::Eeg,
            epoch: 1,
            samples: vec![],
            reason: FlushReason::Interval,
            flushed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let hub = BroadcastHub::new(8);
        let (_, mut rx) = hub.subscribe(Channel::RawData);
        hub.publish(Envelope::RawData(batch()));
        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope, Envelope::RawData(_)));
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let hub = BroadcastHub::new(8);
        let (_, mut lifecycle_rx) = hub.subscribe(Channel::Lifecycle);
        hub.publish(Envelope::RawData(batch()));
        hub.lifecycle(LifecycleEvent::StreamingStarted);
        let envelope = lifecycle_rx.recv().await.unwrap();
        assert!(matches!(envelope, Envelope::Lifecycle(_)));
        assert!(lifecycle_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let hub = BroadcastHub::new(8);
        let (_, _rx) = hub.subscribe_with_depth(Channel::RawData, 2);
        for _ in 0..10 {
            hub.publish(Envelope::RawData(batch()));
        }
        let stats = hub.stats(Channel::RawData);
        assert_eq!(stats.published, 10);
        assert_eq!(stats.dropped, 8);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let hub = BroadcastHub::new(8);
        let (_, rx) = hub.subscribe(Channel::Lifecycle);
        drop(rx);
        hub.lifecycle(LifecycleEvent::ScanStarted);
        hub.lifecycle(LifecycleEvent::ScanStarted);
        assert_eq!(hub.stats(Channel::Lifecycle).subscribers, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = BroadcastHub::new(8);
        let (id, mut rx) = hub.subscribe(Channel::Lifecycle);
        assert!(hub.unsubscribe(Channel::Lifecycle, id));
        hub.lifecycle(LifecycleEvent::ScanStarted);

        assert_eq!(hub.stats(Channel::Lifecycle).subscribers, 0);
        // The sender side is gone, so the stream reports closed.
        assert!(rx.recv().await.is_none());
        // Unsubscribing twice is a no-op.
        assert!(!hub.unsubscribe(Channel::Lifecycle, id));
    }
}
