// Accelerometer statistics and coarse activity classification.

use crate::types::{
    AccMetrics, ActivityClass, ProcessedSample, SampleBatch, SensorKind, SensorMetrics,
};

/// Mean deviation from 1 g above which the wearer counts as moving.
const MOVING_THRESHOLD_G: f64 = 0.05;

pub struct AccProcessor;

impl AccProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Per-axis variance and movement magnitude over one batch. Unlike the
    /// other sensors this needs no rolling history.
    pub fn process(&mut self, batch: &SampleBatch) -> Option<ProcessedSample> {
        if batch.is_empty() {
            return None;
        }
        let n = batch.len() as f64;

        let mut mean = [0.0f64; 3];
        for sample in &batch.samples {
            for axis in 0..3 {
                mean[axis] += sample.channels.get(axis).copied().unwrap_or(0.0);
            }
        }
        for m in &mut mean {
            *m /= n;
        }

        let mut variance = [0.0f64; 3];
        let mut magnitude = 0.0;
        let mut filtered = Vec::with_capacity(batch.len());
        for sample in &batch.samples {
            let mut norm_sq = 0.0;
            for axis in 0..3 {
                let v = sample.channels.get(axis).copied().unwrap_or(0.0);
                variance[axis] += (v - mean[axis]).powi(2);
                norm_sq += v * v;
            }
            let deviation = (norm_sq.sqrt() - 1.0).abs();
            magnitude += deviation;
            filtered.push(deviation);
        }
        for v in &mut variance {
            *v /= n;
        }
        magnitude /= n;

        let activity = if magnitude > MOVING_THRESHOLD_G {
            ActivityClass::Moving
        } else {
            ActivityClass::Stationary
        };

        Some(ProcessedSample {
            kind: SensorKind::Acc,
            timestamp_ms: batch.samples[0].timestamp_ms,
            filtered,
            // The accelerometer has no artifact model; readings are taken
            // at face value.
            quality: 1.0,
            metrics: SensorMetrics::Acc(AccMetrics {
                variance,
                magnitude,
                activity,
            }),
        })
    }

    pub fn reset(&mut self) {}
}

impl Default for AccProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlushReason, RawSample};
    use chrono::Utc;

    fn batch(frames: Vec<[f64; 3]>) -> SampleBatch {
        let samples = frames
            .into_iter()
            .enumerate()
            .map(|(i, f)| RawSample {
                kind: SensorKind::Acc,
                seq: i as u64,
                timestamp_ms: i as f64,
                channels: f.to_vec(),
            })
            .collect();
        SampleBatch {
            kind: SensorKind::Acc,
            epoch: 1,
            samples,
            reason: FlushReason::Full,
            flushed_at: Utc::now(),
        }
    }

    #[test]
    fn test_resting_device_is_stationary() {
        let mut processor = AccProcessor::new();
        let frames = vec![[0.0, 0.0, 1.0]; 13];
        let output = processor.process(&batch(frames)).unwrap();
        let SensorMetrics::Acc(metrics) = &output.metrics else {
            panic!("expected ACC metrics");
        };
        assert_eq!(metrics.activity, ActivityClass::Stationary);
        assert!(metrics.magnitude < 1e-9);
        assert!(metrics.variance.iter().all(|v| *v < 1e-12));
    }

    #[test]
    fn test_shaking_device_is_moving() {
        let mut processor = AccProcessor::new();
        let frames: Vec<[f64; 3]> = (0..13)
            .map(|i| {
                let s = if i % 2 == 0 { 0.5 } else { -0.5 };
                [s, 0.0, 1.0]
            })
            .collect();
        let output = processor.process(&batch(frames)).unwrap();
        let SensorMetrics::Acc(metrics) = &output.metrics else {
            panic!("expected ACC metrics");
        };
        assert_eq!(metrics.activity, ActivityClass::Moving);
        assert!(metrics.variance[0] > 0.2);
        assert!(metrics.variance[1] < 1e-12);
    }

    #[test]
    fn test_empty_batch_yields_nothing() {
        let mut processor = AccProcessor::new();
        assert!(processor.process(&batch(vec![])).is_none());
    }
}
