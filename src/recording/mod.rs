// Recording subsystem.
//
// At most one session at a time. A session subscribes to the hub, persists
// raw samples in the caller's chosen encoding (CSV per sensor by default,
// JSONL on request or as fallback), processed metrics, and lifecycle/monitor
// events, and closes with a manifest describing exactly what was captured.

pub mod writer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::hub::{BroadcastHub, Channel, Envelope, LifecycleEvent};
use crate::types::{DeviceHandle, SensorKind};

/// On-disk encoding for raw sample files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingFormat {
    /// One CSV per sensor with a fixed channel schema.
    #[default]
    Csv,
    /// Line-delimited JSON, one sample per line.
    Jsonl,
}

/// Identity of a running or finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub label: Option<String>,
    pub directory: PathBuf,
    pub format: RecordingFormat,
    pub started_at: DateTime<Utc>,
}

/// Written as `manifest.json` when a session closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub device: Option<DeviceHandle>,
    /// Encoding the session was asked to write.
    pub encoding: RecordingFormat,
    /// Sensors whose CSV output had to degrade to JSONL mid-session.
    pub fallbacks: Vec<String>,
    /// Raw samples persisted, per sensor kind.
    pub raw_counts: HashMap<String, u64>,
    pub processed_count: u64,
    pub event_count: u64,
    pub files: Vec<String>,
}

struct ActiveSession {
    info: SessionInfo,
    cancel: CancellationToken,
    task: JoinHandle<SessionManifest>,
}

pub struct RecordingManager {
    config: CoreConfig,
    hub: Arc<BroadcastHub>,
    active: Mutex<Option<ActiveSession>>,
}

impl RecordingManager {
    pub fn new(config: CoreConfig, hub: Arc<BroadcastHub>) -> Arc<Self> {
        Arc::new(Self {
            config,
            hub,
            active: Mutex::new(None),
        })
    }

    /// Start a session. The session directory is created under `destination`
    /// when given, otherwise under the configured recording directory. Fails
    /// if a session is already running or the destination cannot be written.
    pub fn start(
        &self,
        label: Option<String>,
        format: RecordingFormat,
        destination: Option<PathBuf>,
        device: Option<DeviceHandle>,
    ) -> CoreResult<SessionInfo> {
        let mut active = self.active.lock();
        if let Some(session) = active.as_ref() {
            return Err(CoreError::RecordingAlreadyActive(
                session.info.session_id.clone(),
            ));
        }

        let session_id = Uuid::new_v4().to_string();
        let base = destination.unwrap_or_else(|| self.config.recording_directory.clone());
        let directory = base.join(&session_id);
        probe_writable(&directory)?;

        let info = SessionInfo {
            session_id: session_id.clone(),
            label: label.clone(),
            directory: directory.clone(),
            format,
            started_at: Utc::now(),
        };

        let cancel = CancellationToken::new();
        let task = spawn_session_writer(
            Arc::clone(&self.hub),
            info.clone(),
            device,
            cancel.clone(),
        );

        *active = Some(ActiveSession {
            info: info.clone(),
            cancel,
            task,
        });
        info!("recording session {} started at {:?}", session_id, directory);
        self.hub
            .lifecycle(LifecycleEvent::RecordingStarted { session_id });
        Ok(info)
    }

    /// Stop the active session, finalize its files, and return the manifest.
    pub async fn stop(&self) -> CoreResult<SessionManifest> {
        let session = self
            .active
            .lock()
            .take()
            .ok_or(CoreError::NoActiveRecording)?;

        session.cancel.cancel();
        let manifest = session
            .task
            .await
            .map_err(|e| CoreError::Encode(format!("session writer panicked: {e}")))?;

        info!(
            "recording session {} stopped: {} raw kinds, {} processed rows",
            manifest.session_id,
            manifest.raw_counts.len(),
            manifest.processed_count
        );
        self.hub.lifecycle(LifecycleEvent::RecordingStopped {
            session_id: manifest.session_id.clone(),
        });
        Ok(manifest)
    }

    pub fn current(&self) -> Option<SessionInfo> {
        self.active.lock().as_ref().map(|s| s.info.clone())
    }
}

/// Create the session directory and verify it accepts writes before
/// committing to the session.
fn probe_writable(directory: &Path) -> CoreResult<()> {
    let not_writable =
        |e: std::io::Error| CoreError::DestinationNotWritable(format!("{}: {e}", directory.display()));
    std::fs::create_dir_all(directory).map_err(not_writable)?;
    let probe = directory.join(".write_probe");
    std::fs::write(&probe, b"ok").map_err(not_writable)?;
    std::fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}

fn spawn_session_writer(
    hub: Arc<BroadcastHub>,
    info: SessionInfo,
    device: Option<DeviceHandle>,
    cancel: CancellationToken,
) -> JoinHandle<SessionManifest> {
    let (_, mut raw_rx) = hub.subscribe(Channel::RawData);
    let (_, mut processed_rx) = hub.subscribe(Channel::ProcessedData);
    let (_, mut lifecycle_rx) = hub.subscribe(Channel::Lifecycle);
    let (_, mut monitor_rx) = hub.subscribe(Channel::MonitorStatus);

    tokio::spawn(async move {
        let mut raw_writers: HashMap<SensorKind, writer::RawSampleWriter> = HashMap::new();
        let mut processed = writer::JsonlWriter::create(&info.directory.join("processed.jsonl"));
        let mut events = writer::JsonlWriter::create(&info.directory.join("events.jsonl"));
        let mut write_errors = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = raw_rx.recv() => {
                    let batch = match envelope {
                        Some(Envelope::RawData(batch)) => batch,
                        Some(_) => continue,
                        None => break,
                    };
                    let writer = match raw_writers.entry(batch.kind) {
                        std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::hash_map::Entry::Vacant(e) => {
                            match writer::RawSampleWriter::create(
                                &info.directory,
                                batch.kind,
                                info.format,
                            ) {
                                Ok(w) => e.insert(w),
                                Err(err) => {
                                    error!("cannot open raw writer for {}: {}", batch.kind, err);
                                    write_errors += 1;
                                    continue;
                                }
                            }
                        }
                    };
                    for sample in &batch.samples {
                        if let Err(e) = writer.append(sample) {
                            write_errors += 1;
                            if write_errors % 100 == 1 {
                                warn!("raw write failed ({} so far): {}", write_errors, e);
                            }
                        }
                    }
                }
                envelope = processed_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let (Envelope::ProcessedData(sample), Ok(w)) =
                        (envelope, processed.as_mut())
                    {
                        if let Err(e) = w.write(&*sample) {
                            write_errors += 1;
                            warn!("processed write failed: {}", e);
                        }
                    }
                }
                envelope = lifecycle_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let (Envelope::Lifecycle(event), Ok(w)) =
                        (envelope, events.as_mut())
                    {
                        if let Err(e) = w.write(&event) {
                            write_errors += 1;
                            warn!("event write failed: {}", e);
                        }
                    }
                }
                envelope = monitor_rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let (Envelope::MonitorStatus(status), Ok(w)) =
                        (envelope, events.as_mut())
                    {
                        if let Err(e) = w.write(&status) {
                            write_errors += 1;
                            warn!("status write failed: {}", e);
                        }
                    }
                }
            }
        }

        // Finalize: flush everything and emit the manifest.
        let mut raw_counts = HashMap::new();
        let mut fallbacks = Vec::new();
        let mut files = Vec::new();
        for (kind, writer) in raw_writers {
            raw_counts.insert(kind.to_string(), writer.rows());
            if writer.fell_back() {
                fallbacks.push(kind.to_string());
            }
            for path in writer.paths() {
                files.push(
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                );
            }
            if let Err(e) = writer.finish() {
                error!("finalizing raw writer failed: {}", e);
            }
        }
        fallbacks.sort();

        let processed_count = match processed {
            Ok(w) => {
                let lines = w.lines();
                if lines > 0 {
                    files.push("processed.jsonl".into());
                }
                if let Err(e) = w.finish() {
                    error!("finalizing processed writer failed: {}", e);
                }
                lines
            }
            Err(_) => 0,
        };
        let event_count = match events {
            Ok(w) => {
                let lines = w.lines();
                if lines > 0 {
                    files.push("events.jsonl".into());
                }
                if let Err(e) = w.finish() {
                    error!("finalizing event writer failed: {}", e);
                }
                lines
            }
            Err(_) => 0,
        };

        let manifest = SessionManifest {
            session_id: info.session_id.clone(),
            label: info.label.clone(),
            started_at: info.started_at,
            ended_at: Utc::now(),
            device,
            encoding: info.format,
            fallbacks,
            raw_counts,
            processed_count,
            event_count,
            files,
        };

        match serde_json::to_vec_pretty(&manifest) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(info.directory.join("manifest.json"), bytes) {
                    error!("writing manifest failed: {}", e);
                }
            }
            Err(e) => error!("encoding manifest failed: {}", e),
        }

        manifest
    })
}
