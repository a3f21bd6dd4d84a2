// PPG beat detection and time-domain heart-rate variability.
//
// Beats are found as local maxima on the band-passed infrared channel with
// an adaptive threshold and a physiological refractory period. RR intervals
// from the rolling beat window feed SDNN, RMSSD, and pNN50.

use std::collections::VecDeque;

use crate::types::{PpgMetrics, ProcessedSample, SampleBatch, SensorKind, SensorMetrics};

use super::filters;

/// Analysis window in samples (8 s at the nominal rate).
const WINDOW_SAMPLES: usize = 512;
/// Beats older than this leave the HRV window (ms).
const BEAT_WINDOW_MS: f64 = 60_000.0;
/// Minimum spacing between beats: 300 ms caps detection at 200 bpm.
const REFRACTORY_MS: f64 = 300.0;
/// RR intervals outside this range are physiologically implausible (ms).
const RR_PLAUSIBLE_MS: (f64, f64) = (300.0, 2000.0);
/// Infrared is the cleanest of the three optical channels.
const IR_CHANNEL: usize = 1;

pub struct PpgProcessor {
    window: VecDeque<(f64, f64)>,
    beats: VecDeque<f64>,
    sample_rate: f64,
}

impl PpgProcessor {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(WINDOW_SAMPLES),
            beats: VecDeque::new(),
            sample_rate: SensorKind::Ppg.sample_rate(),
        }
    }

    pub fn process(&mut self, batch: &SampleBatch) -> Option<ProcessedSample> {
        for sample in &batch.samples {
            let value = sample.channels.get(IR_CHANNEL).copied().unwrap_or(0.0);
            if self.window.len() == WINDOW_SAMPLES {
                self.window.pop_front();
            }
            self.window.push_back((sample.timestamp_ms, value));
        }

        if batch.is_empty() || self.window.len() < WINDOW_SAMPLES / 2 {
            return None;
        }

        let timestamps: Vec<f64> = self.window.iter().map(|(t, _)| *t).collect();
        let raw: Vec<f64> = self.window.iter().map(|(_, v)| *v).collect();
        // Cardiac band: 0.5–4 Hz covers 30–240 bpm.
        let filtered = filters::bandpass(&raw, self.sample_rate, 0.5, 4.0);

        self.detect_beats(&timestamps, &filtered);

        let rr = self.rr_intervals();
        if rr.len() < 2 {
            return None;
        }

        let last_rr = rr[rr.len() - 1];
        let mean_rr = rr.iter().sum::<f64>() / rr.len() as f64;
        let sdnn = {
            let var =
                rr.iter().map(|x| (x - mean_rr).powi(2)).sum::<f64>() / rr.len() as f64;
            var.sqrt()
        };
        let diffs: Vec<f64> = rr.windows(2).map(|w| w[1] - w[0]).collect();
        let rmssd =
            (diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len().max(1) as f64).sqrt();
        let pnn50 =
            diffs.iter().filter(|d| d.abs() > 50.0).count() as f64 / diffs.len().max(1) as f64;

        let plausible = rr
            .iter()
            .filter(|x| **x >= RR_PLAUSIBLE_MS.0 && **x <= RR_PLAUSIBLE_MS.1)
            .count();
        let quality = plausible as f64 / rr.len() as f64;

        let metrics = PpgMetrics {
            heart_rate_bpm: 60_000.0 / last_rr,
            windowed_heart_rate_bpm: 60_000.0 / mean_rr,
            sdnn_ms: sdnn,
            rmssd_ms: rmssd,
            pnn50,
            beat_count: self.beats.len(),
        };

        let tail = filtered.len().saturating_sub(batch.len());
        Some(ProcessedSample {
            kind: SensorKind::Ppg,
            timestamp_ms: batch.samples[0].timestamp_ms,
            filtered: filtered[tail..].to_vec(),
            quality,
            metrics: SensorMetrics::Ppg(metrics),
        })
    }

    /// Local maxima above an adaptive threshold, honoring the refractory
    /// period against the most recent accepted beat.
    fn detect_beats(&mut self, timestamps: &[f64], filtered: &[f64]) {
        let n = filtered.len();
        if n < 3 {
            return;
        }
        let mean = filtered.iter().sum::<f64>() / n as f64;
        let std =
            (filtered.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        let threshold = mean + 0.5 * std;

        for i in 1..n - 1 {
            let v = filtered[i];
            if v > threshold && v >= filtered[i - 1] && v > filtered[i + 1] {
                let ts = timestamps[i];
                let accept = match self.beats.back() {
                    Some(last) => ts > last + REFRACTORY_MS,
                    None => true,
                };
                if accept {
                    self.beats.push_back(ts);
                }
            }
        }

        // Age out beats beyond the HRV window.
        if let Some(&newest) = self.beats.back() {
            while let Some(&oldest) = self.beats.front() {
                if newest - oldest > BEAT_WINDOW_MS {
                    self.beats.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn rr_intervals(&self) -> Vec<f64> {
        self.beats
            .iter()
            .zip(self.beats.iter().skip(1))
            .map(|(a, b)| b - a)
            .collect()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.beats.clear();
    }
}

impl Default for PpgProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlushReason, RawSample};
    use chrono::Utc;
    use std::f64::consts::PI;

    fn pulse_batch(bpm: f64, start: usize, count: usize) -> SampleBatch {
        let rate = SensorKind::Ppg.sample_rate();
        let freq = bpm / 60.0;
        let samples = (start..start + count)
            .map(|i| {
                let t = i as f64 / rate;
                let v = 50_000.0 + 2_000.0 * (2.0 * PI * freq * t).sin();
                RawSample {
                    kind: SensorKind::Ppg,
                    seq: i as u64,
                    timestamp_ms: t * 1000.0,
                    channels: vec![0.0, v, 0.0],
                }
            })
            .collect();
        SampleBatch {
            kind: SensorKind::Ppg,
            epoch: 1,
            samples,
            reason: FlushReason::Full,
            flushed_at: Utc::now(),
        }
    }

    fn run(bpm: f64, seconds: usize) -> Option<ProcessedSample> {
        let mut processor = PpgProcessor::new();
        let rate = SensorKind::Ppg.sample_rate() as usize;
        let mut output = None;
        for s in 0..seconds {
            output = processor.process(&pulse_batch(bpm, s * rate, rate));
        }
        output
    }

    #[test]
    fn test_no_output_until_enough_signal() {
        let mut processor = PpgProcessor::new();
        assert!(processor.process(&pulse_batch(72.0, 0, 64)).is_none());
    }

    #[test]
    fn test_heart_rate_recovered_from_clean_pulse() {
        let output = run(72.0, 12).unwrap();
        let SensorMetrics::Ppg(metrics) = &output.metrics else {
            panic!("expected PPG metrics");
        };
        assert!((metrics.windowed_heart_rate_bpm - 72.0).abs() < 5.0);
        assert!((metrics.heart_rate_bpm - 72.0).abs() < 8.0);
        assert!(metrics.beat_count >= 8);
    }

    #[test]
    fn test_steady_pulse_has_low_variability() {
        let output = run(60.0, 12).unwrap();
        let SensorMetrics::Ppg(metrics) = &output.metrics else {
            panic!("expected PPG metrics");
        };
        // A metronomic pulse leaves only sampling-grid jitter.
        assert!(metrics.sdnn_ms < 20.0);
        assert!(metrics.rmssd_ms < 30.0);
        assert!(metrics.pnn50 < 0.01);
        assert!(output.quality > 0.99);
    }

    #[test]
    fn test_reset_clears_beats() {
        let mut processor = PpgProcessor::new();
        let rate = SensorKind::Ppg.sample_rate() as usize;
        for s in 0..12 {
            processor.process(&pulse_batch(72.0, s * rate, rate));
        }
        processor.reset();
        assert!(processor.process(&pulse_batch(72.0, 0, 64)).is_none());
    }
}
