use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::SensorKind;

/// Core configuration loaded from environment variables.
///
/// All tuning values (grace period, staleness windows, batch sizes, flush
/// intervals) are policy, not correctness; the defaults mirror the cadences
/// of the target hardware.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// BLE scan duration when discovering devices.
    pub scan_duration: Duration,
    /// Hard timeout on a single connect attempt.
    pub connect_timeout: Duration,
    /// Reconnect automatically after an unexpected link drop.
    pub auto_reconnect: bool,
    /// Maximum reconnect attempts before surfacing a fatal event.
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_backoff_base: Duration,
    /// Grace period after (re)initialization during which strict
    /// data-flow checks are relaxed.
    pub monitor_grace_period: Duration,
    /// Monitor status push cadence while initializing.
    pub monitor_cadence_initializing: Duration,
    /// Monitor status push cadence once active.
    pub monitor_cadence_active: Duration,
    /// Include battery in the monitor's staleness picture.
    pub monitor_battery: bool,
    /// Per-sensor ring buffer capacity (packets).
    pub pipeline_buffer_capacity: usize,
    /// Upper bound on wall-clock delay before a partial batch is flushed.
    pub pipeline_flush_interval: Duration,
    /// Per-subscriber hub queue depth.
    pub hub_queue_depth: usize,
    /// Telemetry writer flushes when this many records are buffered...
    pub telemetry_batch_size: usize,
    /// ...or when this much time has passed, whichever comes first.
    pub telemetry_flush_interval: Duration,
    /// Bounded telemetry ingest queue; beyond it the oldest records drop.
    pub telemetry_queue_depth: usize,
    /// Detailed telemetry rows older than this get rolled into summaries.
    pub telemetry_retention: Duration,
    /// Path of the telemetry SQLite database.
    pub telemetry_db_path: PathBuf,
    /// Default directory for recording sessions.
    pub recording_directory: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(15),
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_backoff_base: Duration::from_millis(500),
            monitor_grace_period: Duration::from_secs(20),
            monitor_cadence_initializing: Duration::from_millis(500),
            monitor_cadence_active: Duration::from_secs(2),
            monitor_battery: false,
            pipeline_buffer_capacity: 512,
            pipeline_flush_interval: Duration::from_millis(250),
            hub_queue_depth: 256,
            telemetry_batch_size: 200,
            telemetry_flush_interval: Duration::from_millis(500),
            telemetry_queue_depth: 10_000,
            telemetry_retention: Duration::from_secs(24 * 3600),
            telemetry_db_path: PathBuf::from("neurostream-telemetry.db"),
            recording_directory: PathBuf::from("recordings"),
        }
    }
}

impl CoreConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            scan_duration: env_duration_secs("NS_SCAN_DURATION_SECONDS", defaults.scan_duration)?,
            connect_timeout: env_duration_secs(
                "NS_CONNECT_TIMEOUT_SECONDS",
                defaults.connect_timeout,
            )?,
            auto_reconnect: env_bool("NS_AUTO_RECONNECT", defaults.auto_reconnect),
            max_reconnect_attempts: env_parse(
                "NS_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            reconnect_backoff_base: env_duration_ms(
                "NS_RECONNECT_BACKOFF_MS",
                defaults.reconnect_backoff_base,
            )?,
            monitor_grace_period: env_duration_secs(
                "NS_GRACE_PERIOD_SECONDS",
                defaults.monitor_grace_period,
            )?,
            monitor_cadence_initializing: env_duration_ms(
                "NS_MONITOR_CADENCE_INIT_MS",
                defaults.monitor_cadence_initializing,
            )?,
            monitor_cadence_active: env_duration_ms(
                "NS_MONITOR_CADENCE_ACTIVE_MS",
                defaults.monitor_cadence_active,
            )?,
            monitor_battery: env_bool("NS_MONITOR_BATTERY", defaults.monitor_battery),
            pipeline_buffer_capacity: env_parse(
                "NS_PIPELINE_BUFFER_CAPACITY",
                defaults.pipeline_buffer_capacity,
            )?,
            pipeline_flush_interval: env_duration_ms(
                "NS_PIPELINE_FLUSH_INTERVAL_MS",
                defaults.pipeline_flush_interval,
            )?,
            hub_queue_depth: env_parse("NS_HUB_QUEUE_DEPTH", defaults.hub_queue_depth)?,
            telemetry_batch_size: env_parse(
                "NS_TELEMETRY_BATCH_SIZE",
                defaults.telemetry_batch_size,
            )?,
            telemetry_flush_interval: env_duration_ms(
                "NS_TELEMETRY_FLUSH_INTERVAL_MS",
                defaults.telemetry_flush_interval,
            )?,
            telemetry_queue_depth: env_parse(
                "NS_TELEMETRY_QUEUE_DEPTH",
                defaults.telemetry_queue_depth,
            )?,
            telemetry_retention: env_duration_secs(
                "NS_TELEMETRY_RETENTION_SECONDS",
                defaults.telemetry_retention,
            )?,
            telemetry_db_path: env::var("NS_TELEMETRY_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.telemetry_db_path),
            recording_directory: env::var("NS_RECORDING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.recording_directory),
        })
    }

    /// Staleness window for a sensor: at least 2 s, and never tighter than
    /// three packet intervals, so slow sensors are not flagged spuriously.
    pub fn staleness_window(&self, kind: SensorKind) -> Duration {
        let floor = Duration::from_secs(2);
        let three_packets = kind.packet_interval() * 3;
        floor.max(three_packets)
    }

    /// Sensors the health monitor expects to see data from.
    pub fn monitored_sensors(&self) -> Vec<SensorKind> {
        SensorKind::ALL
            .into_iter()
            .filter(|k| self.monitor_battery || *k != SensorKind::Battery)
            .collect()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_duration_ms(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(env_parse(
        key,
        default.as_millis() as u64,
    )?))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = CoreConfig::default();
        assert!(config.monitor_grace_period >= Duration::from_secs(15));
        assert!(config.monitor_grace_period <= Duration::from_secs(30));
        assert!(config.monitor_cadence_initializing < config.monitor_cadence_active);
    }

    #[test]
    fn test_staleness_window_floors_at_two_seconds() {
        let config = CoreConfig::default();
        // EEG packets every ~47 ms; the 2 s floor dominates.
        assert_eq!(
            config.staleness_window(SensorKind::Eeg),
            Duration::from_secs(2)
        );
        // Battery packets every 1 s; three intervals dominate.
        assert_eq!(
            config.staleness_window(SensorKind::Battery),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_battery_excluded_from_monitoring_by_default() {
        let config = CoreConfig::default();
        let monitored = config.monitored_sensors();
        assert_eq!(monitored.len(), 3);
        assert!(!monitored.contains(&SensorKind::Battery));
    }
}
