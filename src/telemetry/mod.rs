// Telemetry subsystem.
//
// Producers hand records to a bounded ingest queue and move on; a writer
// task batches them into SQLite, flushing on size or on a timer. Ingest
// never blocks: when the queue is full, or a batch cannot be written after
// bounded retries, the records are counted and dropped.

pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CoreConfig;
use crate::hub::{BroadcastHub, Channel, Envelope};

pub use store::{StoredRecord, SummaryRow, TelemetryQuery, TelemetryStore};

/// How often the retention sweep archives old detail rows.
const RETENTION_SWEEP: Duration = Duration::from_secs(3600);
/// Compact the database file once a sweep archives at least this many rows.
const COMPACT_THRESHOLD: usize = 1000;
/// Retries for one failed batch write.
const WRITE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Kind-specific half of a record. The tag discriminates the union and is
/// persisted alongside the common fields so queries can filter on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryBody {
    /// Free-form log line.
    Log,
    /// Named numeric measurement.
    Metric {
        name: String,
        value: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// Duration of one timed operation.
    Performance { operation: String, duration_ms: f64 },
    /// Condition that needs attention, attributed to its source.
    Alert { source: String },
    /// Aggregate rolled up from detail records.
    Summary {
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        count: u64,
    },
}

impl TelemetryBody {
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryBody::Log => "log",
            TelemetryBody::Metric { .. } => "metric",
            TelemetryBody::Performance { .. } => "performance",
            TelemetryBody::Alert { .. } => "alert",
            TelemetryBody::Summary { .. } => "summary",
        }
    }
}

/// One telemetry event: a common envelope plus the kind-specific body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(flatten)]
    pub body: TelemetryBody,
}

impl TelemetryRecord {
    /// A plain log record.
    pub fn new(severity: Severity, category: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            category: category.to_string(),
            message: message.into(),
            payload: None,
            body: TelemetryBody::Log,
        }
    }

    pub fn metric(category: &str, name: &str, value: f64, unit: Option<&str>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: Severity::Debug,
            category: category.to_string(),
            message: format!("{name} = {value}"),
            payload: None,
            body: TelemetryBody::Metric {
                name: name.to_string(),
                value,
                unit: unit.map(str::to_string),
            },
        }
    }

    pub fn performance(category: &str, operation: &str, duration_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: Severity::Debug,
            category: category.to_string(),
            message: format!("{operation} took {duration_ms:.1} ms"),
            payload: None,
            body: TelemetryBody::Performance {
                operation: operation.to_string(),
                duration_ms,
            },
        }
    }

    pub fn alert(
        severity: Severity,
        category: &str,
        source: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            category: category.to_string(),
            message: message.into(),
            payload: None,
            body: TelemetryBody::Alert {
                source: source.to_string(),
            },
        }
    }

    pub fn summary(
        category: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        count: u64,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: Severity::Info,
            category: category.to_string(),
            message: format!("{count} records between {period_start} and {period_end}"),
            payload: None,
            body: TelemetryBody::Summary {
                period_start,
                period_end,
                count,
            },
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

pub struct TelemetryService {
    store: Arc<TelemetryStore>,
    tx: mpsc::Sender<TelemetryRecord>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryService {
    /// Start the writer task. Records arrive through `record` or as
    /// envelopes on the hub's telemetry channel.
    pub fn spawn(
        config: &CoreConfig,
        store: Arc<TelemetryStore>,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.telemetry_queue_depth);
        let dropped = Arc::new(AtomicU64::new(0));
        let service = Arc::new(Self {
            store: Arc::clone(&store),
            tx,
            dropped: Arc::clone(&dropped),
        });

        let task = spawn_writer(
            config.telemetry_batch_size,
            config.telemetry_flush_interval,
            chrono::Duration::from_std(config.telemetry_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            store,
            hub,
            rx,
            dropped,
            cancel,
        );
        (service, task)
    }

    /// Enqueue one record. Never blocks; a full or closed queue drops the
    /// record and bumps the counter.
    pub fn record(&self, record: TelemetryRecord) {
        if self.tx.try_send(record).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1000 == 0 {
                warn!("telemetry queue saturated, {} records dropped", dropped);
            }
        }
    }

    /// Records lost so far: ingest-queue overflow plus batches the writer
    /// gave up on after its retries.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_writer(
    batch_size: usize,
    flush_interval: Duration,
    retention: chrono::Duration,
    store: Arc<TelemetryStore>,
    hub: Arc<BroadcastHub>,
    mut rx: mpsc::Receiver<TelemetryRecord>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (_, mut hub_rx) = hub.subscribe(Channel::Telemetry);
    tokio::spawn(async move {
        let mut buffer: Vec<TelemetryRecord> = Vec::with_capacity(batch_size);
        let mut flush_tick = tokio::time::interval(flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval(RETENTION_SWEEP);
        // The first tick of an interval fires immediately.
        sweep_tick.tick().await;
        // Once the hub closes this channel its recv resolves immediately;
        // the arm must be disabled or it starves the timers below.
        let mut hub_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    flush(&store, &mut buffer, &dropped).await;
                    info!("telemetry writer stopped");
                    break;
                }
                record = rx.recv() => match record {
                    Some(record) => {
                        buffer.push(record);
                        if buffer.len() >= batch_size {
                            flush(&store, &mut buffer, &dropped).await;
                        }
                    }
                    None => {
                        flush(&store, &mut buffer, &dropped).await;
                        break;
                    }
                },
                envelope = hub_rx.recv(), if hub_open => match envelope {
                    Some(Envelope::Telemetry(record)) => {
                        buffer.push(record);
                        if buffer.len() >= batch_size {
                            flush(&store, &mut buffer, &dropped).await;
                        }
                    }
                    Some(_) => {}
                    None => hub_open = false,
                },
                _ = flush_tick.tick() => {
                    flush(&store, &mut buffer, &dropped).await;
                }
                _ = sweep_tick.tick() => {
                    let cutoff = Utc::now() - retention;
                    match store.archive(cutoff) {
                        Ok(archived) if archived >= COMPACT_THRESHOLD => {
                            if let Err(e) = store.compact() {
                                warn!("telemetry compact failed: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("telemetry archive failed: {}", e),
                    }
                }
            }
        }
    })
}

/// Write the buffered batch, retrying with backoff before giving it up.
/// Records lost past the retry bound are added to the dropped counter.
async fn flush(store: &TelemetryStore, buffer: &mut Vec<TelemetryRecord>, dropped: &AtomicU64) {
    if buffer.is_empty() {
        return;
    }
    for attempt in 0..WRITE_RETRIES {
        match store.insert_batch(buffer) {
            Ok(_) => {
                buffer.clear();
                return;
            }
            Err(e) => {
                warn!(
                    "telemetry batch write failed (attempt {}): {}",
                    attempt + 1,
                    e
                );
                tokio::time::sleep(Duration::from_millis(50u64 << attempt)).await;
            }
        }
    }
    error!(
        "telemetry batch of {} records lost after {} attempts",
        buffer.len(),
        WRITE_RETRIES
    );
    dropped.fetch_add(buffer.len() as u64, Ordering::Relaxed);
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CoreConfig {
        CoreConfig {
            telemetry_batch_size: 3,
            telemetry_flush_interval: Duration::from_millis(50),
            telemetry_queue_depth: 64,
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_size_triggered_batch_write() {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let hub = BroadcastHub::new(8);
        let cancel = CancellationToken::new();
        let (service, task) =
            TelemetryService::spawn(&test_config(), Arc::clone(&store), hub, cancel.clone());

        for i in 0..3 {
            service.record(TelemetryRecord::new(
                Severity::Info,
                "test",
                format!("event {i}"),
            ));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.event_count().unwrap(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_flush_of_partial_batch() {
        // The hub Arc is dropped right after spawn, closing its telemetry
        // channel; the timer-driven flush must still fire.
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let hub = BroadcastHub::new(8);
        let cancel = CancellationToken::new();
        let (service, task) =
            TelemetryService::spawn(&test_config(), Arc::clone(&store), hub, cancel.clone());

        service.record(TelemetryRecord::new(Severity::Warning, "test", "lonely"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.event_count().unwrap(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hub_envelopes_are_persisted() {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let hub = BroadcastHub::new(8);
        let cancel = CancellationToken::new();
        let (_service, task) = TelemetryService::spawn(
            &test_config(),
            Arc::clone(&store),
            Arc::clone(&hub),
            cancel.clone(),
        );

        hub.publish(Envelope::Telemetry(TelemetryRecord::new(
            Severity::Error,
            "monitor",
            "stream degraded",
        )));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let rows = store
            .query(&TelemetryQuery {
                category: Some("monitor".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_record_never_blocks_after_shutdown() {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let hub = BroadcastHub::new(8);
        let cancel = CancellationToken::new();
        let (service, task) =
            TelemetryService::spawn(&test_config(), store, hub, cancel.clone());

        cancel.cancel();
        task.await.unwrap();

        for _ in 0..10 {
            service.record(TelemetryRecord::new(Severity::Debug, "test", "late"));
        }
        assert_eq!(service.dropped(), 10);
    }

    #[tokio::test]
    async fn test_unwritable_batches_count_as_dropped() {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let hub = BroadcastHub::new(8);
        let cancel = CancellationToken::new();
        let (service, task) =
            TelemetryService::spawn(&test_config(), Arc::clone(&store), hub, cancel.clone());

        store.drop_events_table();
        service.record(TelemetryRecord::new(Severity::Info, "test", "doomed a"));
        service.record(TelemetryRecord::new(Severity::Info, "test", "doomed b"));
        // Interval flush plus three retry backoffs.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(service.dropped() >= 2, "dropped = {}", service.dropped());

        cancel.cancel();
        task.await.unwrap();
    }
}
