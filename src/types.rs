// Core data model shared by every subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The sensor families carried by the wearable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Eeg,
    Ppg,
    Acc,
    Battery,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Eeg,
        SensorKind::Ppg,
        SensorKind::Acc,
        SensorKind::Battery,
    ];

    /// Nominal sampling rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        match self {
            SensorKind::Eeg => 256.0,
            SensorKind::Ppg => 64.0,
            SensorKind::Acc => 52.0,
            SensorKind::Battery => 1.0,
        }
    }

    /// Samples carried per radio packet.
    pub fn samples_per_packet(&self) -> usize {
        match self {
            SensorKind::Eeg => 12,
            SensorKind::Ppg => 6,
            SensorKind::Acc => 3,
            SensorKind::Battery => 1,
        }
    }

    /// Number of value channels per sample.
    pub fn channel_count(&self) -> usize {
        match self {
            SensorKind::Eeg => 4,
            SensorKind::Ppg => 3,
            SensorKind::Acc => 3,
            SensorKind::Battery => 1,
        }
    }

    pub fn channel_names(&self) -> &'static [&'static str] {
        match self {
            SensorKind::Eeg => &["tp9", "af7", "af8", "tp10"],
            SensorKind::Ppg => &["ambient", "infrared", "red"],
            SensorKind::Acc => &["x", "y", "z"],
            SensorKind::Battery => &["level"],
        }
    }

    /// Wall-clock interval between consecutive radio packets.
    pub fn packet_interval(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_packet() as f64 / self.sample_rate())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Eeg => "eeg",
            SensorKind::Ppg => "ppg",
            SensorKind::Acc => "acc",
            SensorKind::Battery => "battery",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded sensor reading. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub kind: SensorKind,
    /// Strictly increasing per sensor kind within one connection epoch.
    pub seq: u64,
    /// Source timestamp in milliseconds since Unix epoch.
    pub timestamp_ms: f64,
    /// Per-channel values, ordered as `SensorKind::channel_names`.
    pub channels: Vec<f64>,
}

/// Why a batch left the buffering pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Size threshold reached.
    Full,
    /// Flush interval elapsed with a partial batch.
    Interval,
    /// Disconnect/stop teardown; best-effort partial flush.
    Shutdown,
}

/// A bounded, ordered group of raw samples of one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBatch {
    pub kind: SensorKind,
    /// Connection epoch the samples belong to.
    pub epoch: u64,
    pub samples: Vec<RawSample>,
    pub reason: FlushReason,
    pub flushed_at: DateTime<Utc>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Coarse motion classification derived from accelerometer energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityClass {
    Stationary,
    Moving,
}

/// EEG spectral band powers in µV²/Hz, plus composite indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EegMetrics {
    pub delta: f64,
    pub theta: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    /// Beta / (alpha + theta) ratio mapped to [0, 1].
    pub focus: f64,
    /// Alpha / (alpha + beta) ratio mapped to [0, 1].
    pub relaxation: f64,
    /// (Beta + gamma) / (delta + theta + alpha) ratio mapped to [0, 1].
    pub stress: f64,
}

/// Heart-rate and time-domain HRV statistics over the rolling beat window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpgMetrics {
    /// Instantaneous heart rate from the most recent inter-beat interval.
    pub heart_rate_bpm: f64,
    /// Mean heart rate over the rolling window.
    pub windowed_heart_rate_bpm: f64,
    /// Standard deviation of RR intervals, milliseconds.
    pub sdnn_ms: f64,
    /// Root mean square of successive RR differences, milliseconds.
    pub rmssd_ms: f64,
    /// Fraction of successive RR differences exceeding 50 ms.
    pub pnn50: f64,
    /// Beats currently in the rolling window.
    pub beat_count: usize,
}

/// Per-axis motion statistics over the batch window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccMetrics {
    pub variance: [f64; 3],
    /// Scalar movement magnitude (mean deviation from 1 g).
    pub magnitude: f64,
    pub activity: ActivityClass,
}

/// Battery housekeeping snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryMetrics {
    pub level_percent: f64,
}

/// Sensor-specific derived metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorMetrics {
    Eeg(EegMetrics),
    Ppg(PpgMetrics),
    Acc(AccMetrics),
    Battery(BatteryMetrics),
}

/// Output of the signal processing engine for one batch.
/// References a span of raw samples no wider than the sensor's window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSample {
    pub kind: SensorKind,
    /// Timestamp of the first raw sample in the originating batch.
    pub timestamp_ms: f64,
    /// Filtered waveform for the batch window (first channel).
    pub filtered: Vec<f64>,
    /// Fraction of the window free of artifacts, in [0, 1].
    pub quality: f64,
    pub metrics: SensorMetrics,
}

/// Connection lifecycle state as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting { address: String },
    Connected { address: String },
    Reconnecting { address: String, attempt: u32 },
}

/// Identity and health of the connected wearable.
/// Owned by the connection manager; read-only copies travel in events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub address: String,
    pub name: String,
    pub state: ConnectionState,
    pub battery_percent: Option<f64>,
    pub rssi: Option<i16>,
    pub connected_at: DateTime<Utc>,
    /// Increments on every successful connect; buffered state is keyed to it.
    pub epoch: u64,
}

/// A device seen during discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_interval_tracks_rate() {
        let eeg = SensorKind::Eeg.packet_interval();
        // 12 samples at 256 Hz ≈ 46.9 ms
        assert!((eeg.as_secs_f64() - 0.046875).abs() < 1e-9);

        let battery = SensorKind::Battery.packet_interval();
        assert_eq!(battery.as_secs_f64(), 1.0);
    }

    #[test]
    fn test_channel_names_match_count() {
        for kind in SensorKind::ALL {
            assert_eq!(kind.channel_names().len(), kind.channel_count());
        }
    }

    #[test]
    fn test_sensor_kind_serde_tags() {
        let json = serde_json::to_string(&SensorKind::Eeg).unwrap();
        assert_eq!(json, "\"eeg\"");
        let back: SensorKind = serde_json::from_str("\"ppg\"").unwrap();
        assert_eq!(back, SensorKind::Ppg);
    }
}
