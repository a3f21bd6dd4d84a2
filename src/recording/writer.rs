// Session file writers.
//
// Raw samples go to one file per sensor kind in the session's chosen
// encoding: CSV with a fixed schema, or JSON Lines. Anything structured
// (processed metrics, lifecycle events, the manifest) is always JSONL.
// If CSV output fails, at creation or on a row, the writer degrades to
// JSONL for that sensor rather than losing data, and reports the fallback
// for the manifest.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::types::{RawSample, SensorKind};

use super::RecordingFormat;

/// Line-delimited JSON writer.
pub struct JsonlWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    lines: u64,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> CoreResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            lines: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, value: &T) -> CoreResult<()> {
        serde_json::to_writer(&mut self.writer, value)?;
        self.writer.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> CoreResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

enum RawBackend {
    Csv(csv::Writer<File>),
    Jsonl(JsonlWriter),
}

/// Per-sensor raw sample writer in the session's encoding, with JSONL as
/// the fallback when CSV cannot be produced.
pub struct RawSampleWriter {
    kind: SensorKind,
    backend: RawBackend,
    paths: Vec<PathBuf>,
    rows: u64,
    fell_back: bool,
}

impl RawSampleWriter {
    pub fn create(dir: &Path, kind: SensorKind, format: RecordingFormat) -> CoreResult<Self> {
        if format == RecordingFormat::Jsonl {
            let path = dir.join(format!("raw_{}.jsonl", kind));
            let writer = JsonlWriter::create(&path)?;
            return Ok(Self {
                kind,
                backend: RawBackend::Jsonl(writer),
                paths: vec![path],
                rows: 0,
                fell_back: false,
            });
        }

        let csv_path = dir.join(format!("raw_{}.csv", kind));
        match Self::open_csv(&csv_path, kind) {
            Ok(writer) => Ok(Self {
                kind,
                backend: RawBackend::Csv(writer),
                paths: vec![csv_path],
                rows: 0,
                fell_back: false,
            }),
            Err(e) => {
                let jsonl_path = dir.join(format!("raw_{}.jsonl", kind));
                warn!(
                    "CSV writer for {} unavailable ({}), falling back to JSONL",
                    kind, e
                );
                let writer = JsonlWriter::create(&jsonl_path)?;
                Ok(Self {
                    kind,
                    backend: RawBackend::Jsonl(writer),
                    paths: vec![jsonl_path],
                    rows: 0,
                    fell_back: true,
                })
            }
        }
    }

    fn open_csv(path: &Path, kind: SensorKind) -> CoreResult<csv::Writer<File>> {
        let mut writer = csv::Writer::from_writer(File::create(path)?);
        let mut header = vec!["timestamp_ms".to_string(), "seq".to_string()];
        header.extend(kind.channel_names().iter().map(|n| n.to_string()));
        writer
            .write_record(&header)
            .map_err(|e| CoreError::Encode(e.to_string()))?;
        Ok(writer)
    }

    pub fn append(&mut self, sample: &RawSample) -> CoreResult<()> {
        let csv_failure = match &mut self.backend {
            RawBackend::Csv(writer) => {
                let mut record = vec![
                    format!("{:.3}", sample.timestamp_ms),
                    sample.seq.to_string(),
                ];
                record.extend(sample.channels.iter().map(|v| v.to_string()));
                writer.write_record(&record).err()
            }
            RawBackend::Jsonl(writer) => {
                writer.write(sample)?;
                None
            }
        };

        if let Some(e) = csv_failure {
            self.switch_to_jsonl(sample, &e)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// A row the tabular encoding cannot carry (schema mismatch, I/O
    /// failure) flips this sensor to JSONL; the failed sample lands there.
    fn switch_to_jsonl(&mut self, sample: &RawSample, cause: &csv::Error) -> CoreResult<()> {
        warn!(
            "CSV append for {} failed ({}), continuing in JSONL",
            self.kind, cause
        );
        let jsonl_path = self
            .paths
            .first()
            .map(|p| p.with_extension("jsonl"))
            .ok_or_else(|| CoreError::Encode("raw writer has no path".into()))?;
        let mut jsonl = JsonlWriter::create(&jsonl_path)?;
        jsonl.write(sample)?;

        let old = std::mem::replace(&mut self.backend, RawBackend::Jsonl(jsonl));
        if let RawBackend::Csv(mut csv) = old {
            if let Err(e) = csv.flush() {
                warn!("flushing abandoned CSV for {} failed: {}", self.kind, e);
            }
        }
        self.paths.push(jsonl_path);
        self.fell_back = true;
        Ok(())
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Files this writer produced; two entries when a CSV was abandoned
    /// mid-session for JSONL.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    pub fn finish(self) -> CoreResult<()> {
        match self.backend {
            RawBackend::Csv(mut writer) => writer
                .flush()
                .map_err(|e| CoreError::Encode(e.to_string())),
            RawBackend::Jsonl(writer) => writer.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc_sample(seq: u64, channels: Vec<f64>) -> RawSample {
        RawSample {
            kind: SensorKind::Acc,
            seq,
            timestamp_ms: 1234.5 + seq as f64,
            channels,
        }
    }

    #[test]
    fn test_csv_writer_fixed_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            RawSampleWriter::create(dir.path(), SensorKind::Acc, RecordingFormat::Csv).unwrap();
        writer.append(&acc_sample(0, vec![0.0, 0.0, 1.0])).unwrap();
        assert_eq!(writer.rows(), 1);
        assert!(!writer.fell_back());
        let path = writer.paths()[0].clone();
        writer.finish().unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "timestamp_ms,seq,x,y,z");
        assert_eq!(lines.next().unwrap(), "1234.500,0,0,0,1");
    }

    #[test]
    fn test_jsonl_as_primary_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            RawSampleWriter::create(dir.path(), SensorKind::Acc, RecordingFormat::Jsonl).unwrap();
        writer.append(&acc_sample(7, vec![0.0, 0.0, 1.0])).unwrap();
        assert!(!writer.fell_back());
        let path = writer.paths()[0].clone();
        assert_eq!(path.file_name().unwrap(), "raw_acc.jsonl");
        writer.finish().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let back: RawSample = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(back.seq, 7);
    }

    #[test]
    fn test_row_that_breaks_the_schema_falls_back_to_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            RawSampleWriter::create(dir.path(), SensorKind::Acc, RecordingFormat::Csv).unwrap();
        writer.append(&acc_sample(0, vec![0.0, 0.0, 1.0])).unwrap();

        // Two channels where the header promises three: the CSV writer
        // rejects the short record, and the sample lands in JSONL instead.
        writer.append(&acc_sample(1, vec![0.5, 0.5])).unwrap();
        assert!(writer.fell_back());
        assert_eq!(writer.rows(), 2);
        assert_eq!(writer.paths().len(), 2);

        let jsonl_path = writer.paths()[1].clone();
        writer.finish().unwrap();
        let contents = std::fs::read_to_string(&jsonl_path).unwrap();
        let back: RawSample = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(back.seq, 1);
        assert_eq!(back.channels, vec![0.5, 0.5]);
    }

    #[test]
    fn test_jsonl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut writer = JsonlWriter::create(&path).unwrap();
        writer
            .write(&RawSample {
                kind: SensorKind::Battery,
                seq: 3,
                timestamp_ms: 9.0,
                channels: vec![88.0],
            })
            .unwrap();
        assert_eq!(writer.lines(), 1);
        writer.finish().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let back: RawSample = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(back.seq, 3);
        assert_eq!(back.channels, vec![88.0]);
    }
}
