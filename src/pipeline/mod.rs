// Acquisition and buffering pipeline.
//
// Consumes raw radio packets from the connection manager, decodes them into
// timestamped samples, buffers per sensor kind, and publishes ordered
// batches on the hub. A batch leaves when it reaches the size target or when
// the flush interval elapses, whichever comes first; link teardown flushes
// whatever remains.

pub mod buffer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::device::packet::{decode_packet, TimestampTracker};
use crate::device::PacketEvent;
use crate::hub::{BroadcastHub, Envelope};
use crate::types::{FlushReason, RawSample, SampleBatch, SensorKind};

use buffer::{OverflowStrategy, SampleBuffer};

#[derive(Default)]
struct SensorCounters {
    packets: AtomicU64,
    samples: AtomicU64,
    decode_errors: AtomicU64,
    gaps: AtomicU64,
}

/// Per-sensor pipeline counters for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub kind: SensorKind,
    pub packets: u64,
    pub samples: u64,
    pub decode_errors: u64,
    /// Packets the counter says we never received.
    pub gaps: u64,
    pub buffered: usize,
    pub buffer_dropped: u64,
}

/// Ingest-local decode state, reset on every new connection epoch.
struct KindState {
    tracker: TimestampTracker,
    next_seq: u64,
    last_wire: Option<u16>,
}

impl KindState {
    fn new(kind: SensorKind) -> Self {
        Self {
            tracker: TimestampTracker::new(kind),
            next_seq: 0,
            last_wire: None,
        }
    }
}

pub struct AcquisitionPipeline {
    config: CoreConfig,
    hub: Arc<BroadcastHub>,
    buffers: HashMap<SensorKind, SampleBuffer>,
    counters: HashMap<SensorKind, SensorCounters>,
    last_seen: RwLock<HashMap<SensorKind, Instant>>,
    epoch: AtomicU64,
}

impl AcquisitionPipeline {
    pub fn new(config: CoreConfig, hub: Arc<BroadcastHub>) -> Arc<Self> {
        let buffers = SensorKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    SampleBuffer::new(
                        kind,
                        config.pipeline_buffer_capacity,
                        OverflowStrategy::DropOldest,
                    ),
                )
            })
            .collect();
        let counters = SensorKind::ALL
            .into_iter()
            .map(|kind| (kind, SensorCounters::default()))
            .collect();
        Arc::new(Self {
            config,
            hub,
            buffers,
            counters,
            last_seen: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        })
    }

    /// Size target per batch: one flush interval's worth of samples.
    fn batch_target(&self, kind: SensorKind) -> usize {
        let per_interval =
            kind.sample_rate() * self.config.pipeline_flush_interval.as_secs_f64();
        (per_interval.ceil() as usize).max(1)
    }

    /// Run the ingest/flush loop until the packet source closes or `cancel`
    /// fires. Remaining samples flush on the way out.
    pub fn spawn(
        self: &Arc<Self>,
        mut packet_rx: mpsc::Receiver<PacketEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut kind_state: HashMap<SensorKind, KindState> = HashMap::new();
            let mut ticker = tokio::time::interval(pipeline.config.pipeline_flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        pipeline.flush_all(FlushReason::Shutdown);
                        info!("pipeline stopped");
                        break;
                    }
                    event = packet_rx.recv() => match event {
                        Some(PacketEvent::Data { epoch, bytes }) => {
                            if epoch != pipeline.epoch.swap(epoch, Ordering::Relaxed) {
                                debug!("pipeline: new connection epoch {}", epoch);
                                kind_state.clear();
                            }
                            pipeline.ingest(&bytes, &mut kind_state);
                        }
                        Some(PacketEvent::LinkDown { epoch }) => {
                            debug!("pipeline: link down for epoch {}", epoch);
                            pipeline.flush_all(FlushReason::Shutdown);
                            kind_state.clear();
                        }
                        None => {
                            pipeline.flush_all(FlushReason::Shutdown);
                            info!("pipeline source closed");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        for kind in SensorKind::ALL {
                            if !pipeline.buffers[&kind].is_empty() {
                                pipeline.flush(kind, FlushReason::Interval);
                            }
                        }
                    }
                }
            }
        })
    }

    /// Decode one packet and buffer its samples.
    fn ingest(&self, bytes: &[u8], kind_state: &mut HashMap<SensorKind, KindState>) {
        let decoded = match decode_packet(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                // Unknown tags get charged to EEG, the busiest stream.
                let kind = bytes
                    .first()
                    .copied()
                    .and_then(crate::device::packet::kind_for_tag)
                    .unwrap_or(SensorKind::Eeg);
                let errors = self.counters[&kind]
                    .decode_errors
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if errors == 1 || errors % 100 == 0 {
                    warn!("packet decode failed ({} so far): {}", errors, e);
                }
                return;
            }
        };

        let kind = decoded.kind;
        let state = kind_state
            .entry(kind)
            .or_insert_with(|| KindState::new(kind));
        let counters = &self.counters[&kind];
        counters.packets.fetch_add(1, Ordering::Relaxed);

        // Count packets the wire counter says we missed.
        if let Some(last) = state.last_wire {
            let gap = decoded.wire_seq.wrapping_sub(last.wrapping_add(1));
            if gap != 0 && gap < 0x8000 {
                counters.gaps.fetch_add(gap as u64, Ordering::Relaxed);
            }
        }
        state.last_wire = Some(decoded.wire_seq);

        let now_ms = Utc::now().timestamp_millis() as f64;
        let packet_ts = state.tracker.stamp(decoded.wire_seq, now_ms);
        let sample_ms = 1000.0 / kind.sample_rate();

        let buffer = &self.buffers[&kind];
        for (i, channels) in decoded.frames.into_iter().enumerate() {
            let sample = RawSample {
                kind,
                seq: state.next_seq,
                timestamp_ms: packet_ts + i as f64 * sample_ms,
                channels,
            };
            state.next_seq += 1;
            buffer.push(sample);
            counters.samples.fetch_add(1, Ordering::Relaxed);
        }
        self.last_seen.write().insert(kind, Instant::now());

        if buffer.len() >= self.batch_target(kind) {
            self.flush(kind, FlushReason::Full);
        }
    }

    /// Drain one sensor's buffer and publish the batch.
    fn flush(&self, kind: SensorKind, reason: FlushReason) {
        let samples = match reason {
            FlushReason::Full => self.buffers[&kind].drain(self.batch_target(kind)),
            _ => self.buffers[&kind].drain_all(),
        };
        if samples.is_empty() {
            return;
        }
        let batch = SampleBatch {
            kind,
            epoch: self.epoch.load(Ordering::Relaxed),
            samples,
            reason,
            flushed_at: Utc::now(),
        };
        self.hub.publish(Envelope::RawData(Arc::new(batch)));
    }

    fn flush_all(&self, reason: FlushReason) {
        for kind in SensorKind::ALL {
            self.flush(kind, reason);
        }
    }

    /// When samples of `kind` last cleared decode.
    pub fn last_seen(&self, kind: SensorKind) -> Option<Instant> {
        self.last_seen.read().get(&kind).copied()
    }

    pub fn snapshot(&self) -> Vec<SensorSnapshot> {
        SensorKind::ALL
            .into_iter()
            .map(|kind| {
                let counters = &self.counters[&kind];
                let buffer = self.buffers[&kind].stats();
                SensorSnapshot {
                    kind,
                    packets: counters.packets.load(Ordering::Relaxed),
                    samples: counters.samples.load(Ordering::Relaxed),
                    decode_errors: counters.decode_errors.load(Ordering::Relaxed),
                    gaps: counters.gaps.load(Ordering::Relaxed),
                    buffered: buffer.depth,
                    buffer_dropped: buffer.dropped,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::packet::TAG_BATTERY;
    use crate::hub::Channel;
    use std::time::Duration;

    fn battery_packet(seq: u16, raw_level: u16) -> Vec<u8> {
        let mut data = vec![TAG_BATTERY];
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&raw_level.to_be_bytes());
        data
    }

    fn test_pipeline() -> (Arc<AcquisitionPipeline>, Arc<BroadcastHub>) {
        let config = CoreConfig {
            pipeline_flush_interval: Duration::from_millis(50),
            ..CoreConfig::default()
        };
        let hub = BroadcastHub::new(64);
        let pipeline = AcquisitionPipeline::new(config, Arc::clone(&hub));
        (pipeline, hub)
    }

    #[tokio::test]
    async fn test_size_triggered_flush() {
        let (pipeline, hub) = test_pipeline();
        let (_, mut raw_rx) = hub.subscribe(Channel::RawData);
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = pipeline.spawn(rx, cancel.clone());

        // Battery batch target is 1 sample, so one packet flushes.
        tx.send(PacketEvent::Data {
            epoch: 1,
            bytes: battery_packet(0, 512 * 50),
        })
        .await
        .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), raw_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Envelope::RawData(batch) = envelope else {
            panic!("expected raw data envelope");
        };
        assert_eq!(batch.kind, SensorKind::Battery);
        assert_eq!(batch.reason, FlushReason::Full);
        assert_eq!(batch.epoch, 1);
        assert_eq!(batch.samples[0].channels[0], 50.0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_link_down_flushes_partial_batches() {
        let (pipeline, hub) = test_pipeline();
        let (_, mut raw_rx) = hub.subscribe(Channel::RawData);
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = pipeline.spawn(rx, cancel.clone());

        // A single EEG packet (12 samples) is below the size target.
        let mut eeg = vec![crate::device::packet::TAG_EEG, 0, 0];
        eeg.extend(std::iter::repeat(0x80).take(4 * 12 * 3 / 2));
        tx.send(PacketEvent::Data {
            epoch: 1,
            bytes: eeg,
        })
        .await
        .unwrap();
        tx.send(PacketEvent::LinkDown { epoch: 1 }).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(1), raw_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Envelope::RawData(batch) = envelope else {
            panic!("expected raw data envelope");
        };
        assert_eq!(batch.kind, SensorKind::Eeg);
        assert_eq!(batch.reason, FlushReason::Shutdown);
        assert_eq!(batch.len(), 12);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wire_gaps_counted() {
        let (pipeline, hub) = test_pipeline();
        let (_, _keepalive) = hub.subscribe(Channel::RawData);
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = pipeline.spawn(rx, cancel.clone());

        for seq in [0u16, 1, 5, 6] {
            tx.send(PacketEvent::Data {
                epoch: 1,
                bytes: battery_packet(seq, 512 * 50),
            })
            .await
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = pipeline.snapshot();
        let battery = snapshot
            .iter()
            .find(|s| s.kind == SensorKind::Battery)
            .unwrap();
        assert_eq!(battery.packets, 4);
        assert_eq!(battery.gaps, 3); // packets 2, 3, 4 never arrived

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_errors_counted_not_fatal() {
        let (pipeline, hub) = test_pipeline();
        let (_, _keepalive) = hub.subscribe(Channel::RawData);
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = pipeline.spawn(rx, cancel.clone());

        tx.send(PacketEvent::Data {
            epoch: 1,
            bytes: vec![0xEE, 0, 0, 1, 2, 3],
        })
        .await
        .unwrap();
        tx.send(PacketEvent::Data {
            epoch: 1,
            bytes: battery_packet(0, 512 * 75),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = pipeline.snapshot();
        let total_errors: u64 = snapshot.iter().map(|s| s.decode_errors).sum();
        assert_eq!(total_errors, 1);
        let battery = snapshot
            .iter()
            .find(|s| s.kind == SensorKind::Battery)
            .unwrap();
        assert_eq!(battery.samples, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_epoch_change_resets_sequences() {
        let (pipeline, hub) = test_pipeline();
        let (_, mut raw_rx) = hub.subscribe(Channel::RawData);
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = pipeline.spawn(rx, cancel.clone());

        tx.send(PacketEvent::Data {
            epoch: 1,
            bytes: battery_packet(100, 512 * 50),
        })
        .await
        .unwrap();
        tx.send(PacketEvent::Data {
            epoch: 2,
            bytes: battery_packet(7, 512 * 50),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut batches = Vec::new();
        while let Ok(Envelope::RawData(batch)) = raw_rx.try_recv() {
            batches.push(batch);
        }
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].epoch, 1);
        assert_eq!(batches[1].epoch, 2);
        // Sequence numbering restarts with the new epoch.
        assert_eq!(batches[1].samples[0].seq, 0);

        // No spurious gap from the wire counter jump across epochs.
        let snapshot = pipeline.snapshot();
        let battery = snapshot
            .iter()
            .find(|s| s.kind == SensorKind::Battery)
            .unwrap();
        assert_eq!(battery.gaps, 0);

        cancel.cancel();
        task.await.unwrap();
    }
}
