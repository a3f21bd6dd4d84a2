// Embedded telemetry store on SQLite.
//
// Detail rows live in `telemetry_events`; `archive` rolls rows older than
// the retention cutoff into hourly per-category counts in
// `telemetry_summaries` and deletes the detail. All access goes through one
// connection behind a mutex, matching SQLite's own serialization.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection};
use serde::Serialize;
use tracing::info;

use crate::error::{CoreError, CoreResult};

use super::{Severity, TelemetryBody, TelemetryRecord};

/// A persisted record with its row id.
#[derive(Debug, Clone, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

/// Filters for `TelemetryStore::query`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TelemetryQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Record kind tag: `log`, `metric`, `performance`, `alert`, `summary`.
    pub kind: Option<String>,
    pub severity: Option<Severity>,
    pub category: Option<String>,
    /// SQL LIKE pattern against the message text.
    pub message_like: Option<String>,
    pub limit: Option<usize>,
}

/// One hourly rollup row.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub bucket_start: String,
    pub category: String,
    pub severity: Severity,
    pub count: u64,
}

pub struct TelemetryStore {
    conn: Mutex<Connection>,
}

impl TelemetryStore {
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS telemetry_events (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind      TEXT NOT NULL,
                severity  TEXT NOT NULL,
                category  TEXT NOT NULL,
                message   TEXT NOT NULL,
                payload   TEXT,
                body      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp
                ON telemetry_events (timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_kind
                ON telemetry_events (kind, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_category
                ON telemetry_events (category, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_severity
                ON telemetry_events (severity, timestamp);
            CREATE TABLE IF NOT EXISTS telemetry_summaries (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_start TEXT NOT NULL,
                category     TEXT NOT NULL,
                severity     TEXT NOT NULL,
                count        INTEGER NOT NULL,
                UNIQUE (bucket_start, category, severity)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a batch inside one transaction.
    pub fn insert_batch(&self, records: &[TelemetryRecord]) -> CoreResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO telemetry_events
                    (timestamp, kind, severity, category, message, payload, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in records {
                let payload = record
                    .payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    record.timestamp.to_rfc3339(),
                    record.body.kind(),
                    record.severity.as_str(),
                    record.category,
                    record.message,
                    payload,
                    serde_json::to_string(&record.body)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    pub fn query(&self, filter: &TelemetryQuery) -> CoreResult<Vec<StoredRecord>> {
        let mut sql = String::from(
            "SELECT id, timestamp, severity, category, message, payload, body
             FROM telemetry_events WHERE 1 = 1",
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", values.len() + 1));
            values.push(Value::Text(since.to_rfc3339()));
        }
        if let Some(until) = filter.until {
            sql.push_str(&format!(" AND timestamp < ?{}", values.len() + 1));
            values.push(Value::Text(until.to_rfc3339()));
        }
        if let Some(kind) = &filter.kind {
            sql.push_str(&format!(" AND kind = ?{}", values.len() + 1));
            values.push(Value::Text(kind.clone()));
        }
        if let Some(severity) = filter.severity {
            sql.push_str(&format!(" AND severity = ?{}", values.len() + 1));
            values.push(Value::Text(severity.as_str().to_string()));
        }
        if let Some(category) = &filter.category {
            sql.push_str(&format!(" AND category = ?{}", values.len() + 1));
            values.push(Value::Text(category.clone()));
        }
        if let Some(pattern) = &filter.message_like {
            sql.push_str(&format!(" AND message LIKE ?{}", values.len() + 1));
            values.push(Value::Text(pattern.clone()));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            let timestamp: String = row.get(1)?;
            let severity: String = row.get(2)?;
            let payload: Option<String> = row.get(5)?;
            Ok((
                row.get::<_, i64>(0)?,
                timestamp,
                severity,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                payload,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, timestamp, severity, category, message, payload, body) = row?;
            out.push(StoredRecord {
                id,
                record: TelemetryRecord {
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|e| CoreError::Encode(e.to_string()))?
                        .with_timezone(&Utc),
                    severity: Severity::parse(&severity)
                        .ok_or_else(|| CoreError::Encode(format!("bad severity {severity}")))?,
                    category,
                    message,
                    payload: payload
                        .map(|p| serde_json::from_str(&p))
                        .transpose()?,
                    body: serde_json::from_str(&body)?,
                },
            });
        }
        Ok(out)
    }

    /// Hourly counts by category and severity across both detail rows and
    /// already-archived summaries.
    pub fn summarize(&self) -> CoreResult<Vec<SummaryRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT bucket_start, category, severity, SUM(count) FROM (
                 SELECT strftime('%Y-%m-%dT%H:00:00+00:00', timestamp) AS bucket_start,
                        category, severity, COUNT(*) AS count
                 FROM telemetry_events
                 GROUP BY 1, 2, 3
                 UNION ALL
                 SELECT bucket_start, category, severity, count
                 FROM telemetry_summaries
             )
             GROUP BY 1, 2, 3
             ORDER BY 1, 2, 3",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (bucket_start, category, severity, count) = row?;
            out.push(SummaryRow {
                bucket_start,
                category,
                severity: Severity::parse(&severity)
                    .ok_or_else(|| CoreError::Encode(format!("bad severity {severity}")))?,
                count: count.max(0) as u64,
            });
        }
        Ok(out)
    }

    /// Roll detail rows older than `cutoff` into hourly summaries, then
    /// delete them. Returns how many detail rows were archived.
    pub fn archive(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let cutoff = cutoff.to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO telemetry_summaries (bucket_start, category, severity, count)
             SELECT strftime('%Y-%m-%dT%H:00:00+00:00', timestamp),
                    category, severity, COUNT(*)
             FROM telemetry_events
             WHERE timestamp < ?1
             GROUP BY 1, 2, 3
             ON CONFLICT (bucket_start, category, severity)
             DO UPDATE SET count = count + excluded.count",
            params![cutoff],
        )?;
        let deleted = tx.execute(
            "DELETE FROM telemetry_events WHERE timestamp < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        if deleted > 0 {
            info!("archived {} telemetry rows", deleted);
        }
        Ok(deleted)
    }

    /// Reclaim file space after archiving.
    pub fn compact(&self) -> CoreResult<()> {
        self.lock().execute_batch("VACUUM")?;
        Ok(())
    }

    pub fn event_count(&self) -> CoreResult<u64> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM telemetry_events", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a holder panicked; the connection
        // itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent insert fail, for exercising the writer's
    /// give-up path.
    #[cfg(test)]
    pub(crate) fn drop_events_table(&self) {
        self.lock()
            .execute_batch("DROP TABLE telemetry_events")
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(
        age_minutes: i64,
        severity: Severity,
        category: &str,
        message: &str,
    ) -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Utc::now() - Duration::minutes(age_minutes),
            severity,
            category: category.to_string(),
            message: message.to_string(),
            payload: Some(serde_json::json!({ "n": age_minutes })),
            body: TelemetryBody::Log,
        }
    }

    #[test]
    fn test_insert_and_query_filters() {
        let store = TelemetryStore::open_in_memory().unwrap();
        store
            .insert_batch(&[
                record(1, Severity::Info, "connection", "connected to device"),
                record(2, Severity::Warning, "pipeline", "decode error"),
                record(3, Severity::Error, "pipeline", "buffer overflow"),
            ])
            .unwrap();

        let pipeline_rows = store
            .query(&TelemetryQuery {
                category: Some("pipeline".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pipeline_rows.len(), 2);

        let errors = store
            .query(&TelemetryQuery {
                severity: Some(Severity::Error),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record.message, "buffer overflow");

        let like = store
            .query(&TelemetryQuery {
                message_like: Some("%decode%".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(like.len(), 1);
        assert_eq!(like[0].record.payload, Some(serde_json::json!({ "n": 2 })));
    }

    #[test]
    fn test_typed_records_round_trip_with_kind_filter() {
        let store = TelemetryStore::open_in_memory().unwrap();
        store
            .insert_batch(&[
                TelemetryRecord::metric("battery", "battery_level", 81.5, Some("%")),
                TelemetryRecord::performance("connection", "connect", 412.0),
                TelemetryRecord::alert(
                    Severity::Error,
                    "connection",
                    "00:11:22:33:44:55",
                    "reconnect attempts exhausted",
                ),
                TelemetryRecord::new(Severity::Info, "lifecycle", "streaming started"),
            ])
            .unwrap();

        let metrics = store
            .query(&TelemetryQuery {
                kind: Some("metric".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(
            metrics[0].record.body,
            TelemetryBody::Metric {
                name: "battery_level".into(),
                value: 81.5,
                unit: Some("%".into()),
            }
        );

        let alerts = store
            .query(&TelemetryQuery {
                kind: Some("alert".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(alerts.len(), 1);
        let TelemetryBody::Alert { source } = &alerts[0].record.body else {
            panic!("expected an alert body");
        };
        assert_eq!(source, "00:11:22:33:44:55");

        let performance = store
            .query(&TelemetryQuery {
                kind: Some("performance".into()),
                ..Default::default()
            })
            .unwrap();
        let TelemetryBody::Performance { duration_ms, .. } = performance[0].record.body else {
            panic!("expected a performance body");
        };
        assert_eq!(duration_ms, 412.0);
    }

    #[test]
    fn test_query_time_window_and_limit() {
        let store = TelemetryStore::open_in_memory().unwrap();
        store
            .insert_batch(&[
                record(120, Severity::Info, "monitor", "old"),
                record(5, Severity::Info, "monitor", "recent a"),
                record(1, Severity::Info, "monitor", "recent b"),
            ])
            .unwrap();

        let recent = store
            .query(&TelemetryQuery {
                since: Some(Utc::now() - Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 2);
        // Newest first.
        assert_eq!(recent[0].record.message, "recent b");

        let limited = store
            .query(&TelemetryQuery {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_archive_rolls_up_and_deletes() {
        let store = TelemetryStore::open_in_memory().unwrap();
        store
            .insert_batch(&[
                record(180, Severity::Warning, "pipeline", "old 1"),
                record(181, Severity::Warning, "pipeline", "old 2"),
                record(1, Severity::Warning, "pipeline", "fresh"),
            ])
            .unwrap();

        let archived = store.archive(Utc::now() - Duration::hours(2)).unwrap();
        assert_eq!(archived, 2);
        assert_eq!(store.event_count().unwrap(), 1);

        let summary = store.summarize().unwrap();
        let rolled: u64 = summary
            .iter()
            .filter(|s| s.category == "pipeline")
            .map(|s| s.count)
            .sum();
        assert_eq!(rolled, 3); // two archived plus one live detail row

        // Archiving again is a no-op.
        assert_eq!(store.archive(Utc::now() - Duration::hours(2)).unwrap(), 0);
        store.compact().unwrap();
    }
}
