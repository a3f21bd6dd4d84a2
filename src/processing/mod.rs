// Signal processing engine.
//
// Consumes raw batches from the hub and publishes derived metrics. Each
// sensor kind has its own stateful processor; all rolling state is keyed to
// the connection epoch and resets when it changes.

pub mod acc;
pub mod eeg;
pub mod filters;
pub mod ppg;
pub mod spectral;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::{BroadcastHub, Channel, Envelope};
use crate::types::{
    BatteryMetrics, ProcessedSample, SampleBatch, SensorKind, SensorMetrics,
};

use acc::AccProcessor;
use eeg::EegProcessor;
use ppg::PpgProcessor;

pub struct SignalProcessor {
    eeg: EegProcessor,
    ppg: PpgProcessor,
    acc: AccProcessor,
    epoch: u64,
}

impl SignalProcessor {
    pub fn new() -> Self {
        Self {
            eeg: EegProcessor::new(),
            ppg: PpgProcessor::new(),
            acc: AccProcessor::new(),
            epoch: 0,
        }
    }

    /// Process one raw batch. Returns `None` while a processor is still
    /// accumulating its analysis window.
    pub fn process(&mut self, batch: &SampleBatch) -> Option<ProcessedSample> {
        if batch.epoch != self.epoch {
            debug!("processor reset for epoch {}", batch.epoch);
            self.reset();
            self.epoch = batch.epoch;
        }

        match batch.kind {
            SensorKind::Eeg => self.eeg.process(batch),
            SensorKind::Ppg => self.ppg.process(batch),
            SensorKind::Acc => self.acc.process(batch),
            SensorKind::Battery => Self::process_battery(batch),
        }
    }

    /// Battery readings pass straight through as housekeeping metrics.
    fn process_battery(batch: &SampleBatch) -> Option<ProcessedSample> {
        let last = batch.samples.last()?;
        let level = last.channels.first().copied()?;
        Some(ProcessedSample {
            kind: SensorKind::Battery,
            timestamp_ms: batch.samples[0].timestamp_ms,
            filtered: batch
                .samples
                .iter()
                .filter_map(|s| s.channels.first().copied())
                .collect(),
            quality: 1.0,
            metrics: SensorMetrics::Battery(BatteryMetrics {
                level_percent: level,
            }),
        })
    }

    pub fn reset(&mut self) {
        self.eeg.reset();
        self.ppg.reset();
        self.acc.reset();
    }
}

impl Default for SignalProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the processing loop: raw batches in, processed samples out.
pub fn spawn(hub: Arc<BroadcastHub>, cancel: CancellationToken) -> JoinHandle<()> {
    let (_, mut raw_rx) = hub.subscribe(Channel::RawData);
    tokio::spawn(async move {
        let mut processor = SignalProcessor::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("signal processor stopped");
                    break;
                }
                envelope = raw_rx.recv() => match envelope {
                    Some(Envelope::RawData(batch)) => {
                        if let Some(processed) = processor.process(&batch) {
                            hub.publish(Envelope::ProcessedData(Arc::new(processed)));
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlushReason, RawSample};
    use chrono::Utc;

    fn battery_batch(epoch: u64, level: f64) -> SampleBatch {
        SampleBatch {
            kind: SensorKind::Battery,
            epoch,
            samples: vec![RawSample {
                kind: SensorKind::Battery,
                seq: 0,
                timestamp_ms: 0.0,
                channels: vec![level],
            }],
            reason: FlushReason::Full,
            flushed_at: Utc::now(),
        }
    }

    #[test]
    fn test_battery_passthrough() {
        let mut processor = SignalProcessor::new();
        let output = processor.process(&battery_batch(1, 82.5)).unwrap();
        let SensorMetrics::Battery(metrics) = &output.metrics else {
            panic!("expected battery metrics");
        };
        assert_eq!(metrics.level_percent, 82.5);
    }

    #[test]
    fn test_epoch_change_resets_state() {
        let mut processor = SignalProcessor::new();
        processor.process(&battery_batch(1, 80.0));
        assert_eq!(processor.epoch, 1);
        processor.process(&battery_batch(3, 79.0));
        assert_eq!(processor.epoch, 3);
    }

    #[tokio::test]
    async fn test_processing_loop_publishes_metrics() {
        let hub = BroadcastHub::new(64);
        let (_, mut processed_rx) = hub.subscribe(Channel::ProcessedData);
        let cancel = CancellationToken::new();
        let task = spawn(Arc::clone(&hub), cancel.clone());

        hub.publish(Envelope::RawData(Arc::new(battery_batch(1, 64.0))));

        let envelope = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            processed_rx.recv(),
        )
        .await
        .unwrap()
        .unwrap();
        let Envelope::ProcessedData(processed) = envelope else {
            panic!("expected processed data");
        };
        assert_eq!(processed.kind, SensorKind::Battery);

        cancel.cancel();
        task.await.unwrap();
    }
}
