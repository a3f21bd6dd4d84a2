// EEG feature extraction: band powers, composites, and signal quality over
// a one-second rolling window per channel.

use std::collections::VecDeque;

use crate::types::{EegMetrics, ProcessedSample, SampleBatch, SensorKind, SensorMetrics};

use super::{filters, spectral};

/// Rolling analysis window, one second at the nominal rate.
const WINDOW_SAMPLES: usize = 256;
/// Filtered amplitudes beyond this are treated as artifacts (µV).
const ARTIFACT_THRESHOLD_UV: f64 = 150.0;
const MAINS_HZ: f64 = 60.0;
const NOTCH_Q: f64 = 30.0;

const BAND_DELTA: (f64, f64) = (1.0, 4.0);
const BAND_THETA: (f64, f64) = (4.0, 8.0);
const BAND_ALPHA: (f64, f64) = (8.0, 13.0);
const BAND_BETA: (f64, f64) = (13.0, 30.0);
const BAND_GAMMA: (f64, f64) = (30.0, 44.0);

pub struct EegProcessor {
    windows: Vec<VecDeque<f64>>,
    sample_rate: f64,
}

impl EegProcessor {
    pub fn new() -> Self {
        let kind = SensorKind::Eeg;
        Self {
            windows: (0..kind.channel_count())
                .map(|_| VecDeque::with_capacity(WINDOW_SAMPLES))
                .collect(),
            sample_rate: kind.sample_rate(),
        }
    }

    /// Fold one batch into the window and, once the window is full, emit
    /// band powers, composites, and a quality estimate.
    pub fn process(&mut self, batch: &SampleBatch) -> Option<ProcessedSample> {
        for sample in &batch.samples {
            for (ch, window) in self.windows.iter_mut().enumerate() {
                if window.len() == WINDOW_SAMPLES {
                    window.pop_front();
                }
                window.push_back(sample.channels.get(ch).copied().unwrap_or(0.0));
            }
        }

        if batch.is_empty() || self.windows[0].len() < WINDOW_SAMPLES {
            return None;
        }

        let mut delta = 0.0;
        let mut theta = 0.0;
        let mut alpha = 0.0;
        let mut beta = 0.0;
        let mut gamma = 0.0;
        let mut artifact_samples = 0usize;
        let mut total_samples = 0usize;
        let mut batch_filtered = Vec::new();

        for (ch, window) in self.windows.iter().enumerate() {
            let raw: Vec<f64> = window.iter().copied().collect();
            let filtered = filters::notch(
                &filters::bandpass(&raw, self.sample_rate, 1.0, 45.0),
                self.sample_rate,
                MAINS_HZ,
                NOTCH_Q,
            );

            artifact_samples += filtered
                .iter()
                .filter(|v| v.abs() > ARTIFACT_THRESHOLD_UV)
                .count();
            total_samples += filtered.len();

            let spectrum = spectral::power_spectrum(&filtered, self.sample_rate);
            let band = |range: (f64, f64)| {
                spectral::band_power(&spectrum, self.sample_rate, filtered.len(), range.0, range.1)
            };
            delta += band(BAND_DELTA);
            theta += band(BAND_THETA);
            alpha += band(BAND_ALPHA);
            beta += band(BAND_BETA);
            gamma += band(BAND_GAMMA);

            if ch == 0 {
                // The emitted waveform covers just the incoming batch.
                let tail = filtered.len().saturating_sub(batch.len());
                batch_filtered = filtered[tail..].to_vec();
            }
        }

        let channels = self.windows.len() as f64;
        delta /= channels;
        theta /= channels;
        alpha /= channels;
        beta /= channels;
        gamma /= channels;

        let quality = if total_samples == 0 {
            0.0
        } else {
            1.0 - artifact_samples as f64 / total_samples as f64
        };

        let metrics = EegMetrics {
            delta,
            theta,
            alpha,
            beta,
            gamma,
            focus: unit_ratio(beta, alpha + theta),
            relaxation: unit_ratio(alpha, beta),
            stress: unit_ratio(beta + gamma, delta + theta + alpha),
        };

        Some(ProcessedSample {
            kind: SensorKind::Eeg,
            timestamp_ms: batch.samples[0].timestamp_ms,
            filtered: batch_filtered,
            quality,
            metrics: SensorMetrics::Eeg(metrics),
        })
    }

    pub fn reset(&mut self) {
        for window in &mut self.windows {
            window.clear();
        }
    }
}

impl Default for EegProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps the ratio `a / b` into [0, 1), saturating as `a` dominates.
fn unit_ratio(a: f64, b: f64) -> f64 {
    if a <= 0.0 {
        return 0.0;
    }
    let r = a / b.max(1e-12);
    r / (1.0 + r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlushReason, RawSample};
    use chrono::Utc;
    use std::f64::consts::PI;

    fn sine_batch(freq: f64, amplitude: f64, start: usize, count: usize) -> SampleBatch {
        let rate = SensorKind::Eeg.sample_rate();
        let samples = (start..start + count)
            .map(|i| {
                let v = amplitude * (2.0 * PI * freq * i as f64 / rate).sin();
                RawSample {
                    kind: SensorKind::Eeg,
                    seq: i as u64,
                    timestamp_ms: i as f64 * 1000.0 / rate,
                    channels: vec![v; 4],
                }
            })
            .collect();
        SampleBatch {
            kind: SensorKind::Eeg,
            epoch: 1,
            samples,
            reason: FlushReason::Full,
            flushed_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_output_until_window_full() {
        let mut processor = EegProcessor::new();
        assert!(processor.process(&sine_batch(10.0, 20.0, 0, 64)).is_none());
        assert!(processor.process(&sine_batch(10.0, 20.0, 64, 64)).is_none());
        assert!(processor.process(&sine_batch(10.0, 20.0, 128, 64)).is_none());
        assert!(processor.process(&sine_batch(10.0, 20.0, 192, 64)).is_some());
    }

    #[test]
    fn test_alpha_tone_dominates_bands() {
        let mut processor = EegProcessor::new();
        processor.process(&sine_batch(10.0, 20.0, 0, 256));
        let output = processor.process(&sine_batch(10.0, 20.0, 256, 64)).unwrap();
        let SensorMetrics::Eeg(metrics) = &output.metrics else {
            panic!("expected EEG metrics");
        };
        assert!(metrics.alpha > metrics.beta);
        assert!(metrics.alpha > metrics.delta);
        assert!(metrics.alpha > metrics.gamma);
        assert!(metrics.relaxation > 0.5);
    }

    #[test]
    fn test_clean_signal_scores_high_quality() {
        let mut processor = EegProcessor::new();
        processor.process(&sine_batch(10.0, 20.0, 0, 256));
        let output = processor.process(&sine_batch(10.0, 20.0, 256, 64)).unwrap();
        assert!(output.quality > 0.95);
        assert_eq!(output.filtered.len(), 64);
    }

    #[test]
    fn test_saturated_signal_scores_low_quality() {
        let mut processor = EegProcessor::new();
        processor.process(&sine_batch(10.0, 900.0, 0, 256));
        let output = processor.process(&sine_batch(10.0, 900.0, 256, 64)).unwrap();
        assert!(output.quality < 0.5);
    }

    #[test]
    fn test_reset_clears_window() {
        let mut processor = EegProcessor::new();
        processor.process(&sine_batch(10.0, 20.0, 0, 256));
        processor.reset();
        assert!(processor.process(&sine_batch(10.0, 20.0, 0, 64)).is_none());
    }
}
