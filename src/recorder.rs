//! # Recording Module
//!
//! Persists the live stream to CSV files while ingestion keeps running.
//!
//! ## Architecture
//! - **RecorderManager**: start/stop lifecycle, one session at a time
//! - **Worker thread**: polls the ring buffer with `get_since` and appends rows
//! - **RecordFileWriter**: buffered CSV writer, fsyncs every `flush_rows` rows
//!
//! The worker never touches the BLE side; the ring buffer is the only thing
//! it shares with ingestion.
//!
//! ## Output layout
//! ```text
//! <root>/
//! └── YYYY-MM-DD/
//!     ├── sensor_data_YYYYMMDD_HHMMSS.csv
//!     └── sensor_data_YYYYMMDD_HHMMSS.meta.json
//! ```
//!
//! ## Stop protocol
//! `stop` signals the worker over a channel, then waits a bounded time for it
//! to hand the writer back. The worker drains the buffer one last time before
//! replying. A worker that misses the deadline is abandoned and the session is
//! recorded as failed.

use crate::buffer::RingBuffer;
use crate::error::RecordingError;
use crate::record::{Record, CSV_HEADER};
use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const DEFAULT_PREFIX: &str = "sensor_data";
const METADATA_EXTENSION: &str = "meta.json";

#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    pub root_dir: PathBuf,
    /// Rows buffered before a write + fsync
    pub flush_rows: usize,
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
}

impl RecorderSettings {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            flush_rows: 100,
            poll_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the recorded data came from, copied into each metadata file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub source: String,
    pub name: Option<String>,
    pub service_uuid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Failed,
}

/// A finished recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub total_samples: u64,
    pub file_path: PathBuf,
    pub file_size_bytes: u64,
    pub data_gaps: u32,
    pub status: SessionStatus,
}

impl RecordingSession {
    pub fn average_sample_rate_hz(&self) -> f64 {
        if self.duration_seconds > 0.0 {
            self.total_samples as f64 / self.duration_seconds
        } else {
            0.0
        }
    }
}

/// Snapshot of the active recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingStatus {
    pub session_id: String,
    pub file_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub elapsed: Duration,
    pub samples_written: u64,
    pub data_gaps: u32,
}

#[derive(Serialize, Deserialize)]
struct SettingsSnapshot {
    flush_rows: usize,
    poll_interval_ms: u64,
    buffer_capacity: usize,
}

#[derive(Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(flatten)]
    session: RecordingSession,
    average_sample_rate_hz: f64,
    device_info: DeviceInfo,
    recording_settings: SettingsSnapshot,
}

/// `<stem>.csv` -> `<stem>.meta.json`
pub fn metadata_path(csv_path: &Path) -> PathBuf {
    csv_path.with_extension(METADATA_EXTENSION)
}

/// CSV file with a header row and batched, fsynced appends
struct RecordFileWriter {
    path: PathBuf,
    file: File,
    pending: String,
    pending_rows: usize,
    flush_rows: usize,
    samples: Arc<AtomicU64>,
}

impl RecordFileWriter {
    /// Create `path` (must not exist) and write the header.
    ///
    /// The file is removed again if the header cannot be written.
    fn create(path: &Path, flush_rows: usize, samples: Arc<AtomicU64>) -> Result<Self, RecordingError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| RecordingError::io(path, e))?;

        if let Err(e) = writeln!(file, "{}", CSV_HEADER) {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(RecordingError::io(path, e));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: String::new(),
            pending_rows: 0,
            flush_rows: flush_rows.max(1),
            samples,
        })
    }

    fn append(&mut self, records: &[Record]) -> Result<(), RecordingError> {
        for record in records {
            self.pending.push_str(&record.to_csv_row());
            self.pending.push('\n');
            self.pending_rows += 1;
            self.samples.fetch_add(1, Ordering::Relaxed);

            if self.pending_rows >= self.flush_rows {
                self.flush()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RecordingError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(self.pending.as_bytes())
            .and_then(|_| self.file.sync_data())
            .map_err(|e| RecordingError::io(&self.path, e))?;
        log::debug!("Flushed {} rows to {}", self.pending_rows, self.path.display());
        self.pending.clear();
        self.pending_rows = 0;
        Ok(())
    }

    /// Flush everything and return the final file size
    fn finish(&mut self) -> Result<u64, RecordingError> {
        self.flush()?;
        self.file
            .sync_all()
            .and_then(|_| self.file.metadata())
            .map(|m| m.len())
            .map_err(|e| RecordingError::io(&self.path, e))
    }
}

impl Drop for RecordFileWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            if let Err(e) = self.flush() {
                log::error!("Failed to flush rows on close: {}", e);
            }
        }
    }
}

struct WorkerExit {
    writer: RecordFileWriter,
    error: Option<RecordingError>,
}

/// Incremental reader from the ring buffer into the file
struct Worker {
    buffer: Arc<RingBuffer>,
    writer: RecordFileWriter,
    /// Buffer contents captured at start, written before the first poll
    backlog: Vec<Record>,
    next_index: u64,
    gaps: Arc<AtomicU32>,
    poll_interval: Duration,
}

impl Worker {
    fn drain(&mut self) -> Result<(), RecordingError> {
        if !self.backlog.is_empty() {
            let backlog = std::mem::take(&mut self.backlog);
            self.writer.append(&backlog)?;
        }
        let read = self.buffer.get_since(self.next_index);
        if read.data_lost {
            let gaps = self.gaps.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!(
                "Recorder fell behind the buffer at index {} (gap #{}), resyncing",
                self.next_index,
                gaps
            );
        }
        self.next_index = read.next_index;
        if !read.records.is_empty() {
            self.writer.append(&read.records)?;
        }
        Ok(())
    }

    fn run(mut self, stop: Receiver<()>, done: Sender<WorkerExit>) {
        log::debug!("Recording worker started at index {}", self.next_index);

        let error = loop {
            if let Err(e) = self.drain() {
                break Some(e);
            }
            match stop.recv_timeout(self.poll_interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break self.drain().err(),
            }
        };

        if let Some(e) = &error {
            log::error!("Recording worker stopped on error: {}", e);
        }
        log::debug!("Recording worker finished");
        let _ = done.send(WorkerExit {
            writer: self.writer,
            error,
        });
    }
}

/// Identity and live counters of the active session
struct SessionInfo {
    session_id: String,
    path: PathBuf,
    start_time: DateTime<Utc>,
    started: Instant,
    samples: Arc<AtomicU64>,
    gaps: Arc<AtomicU32>,
}

impl SessionInfo {
    fn status(&self) -> RecordingStatus {
        RecordingStatus {
            session_id: self.session_id.clone(),
            file_path: self.path.clone(),
            start_time: self.start_time,
            elapsed: self.started.elapsed(),
            samples_written: self.samples.load(Ordering::Relaxed),
            data_gaps: self.gaps.load(Ordering::Relaxed),
        }
    }

    fn finish(&self, status: SessionStatus, file_size_bytes: u64) -> RecordingSession {
        RecordingSession {
            session_id: self.session_id.clone(),
            start_time: self.start_time,
            end_time: Utc::now(),
            duration_seconds: self.started.elapsed().as_secs_f64(),
            total_samples: self.samples.load(Ordering::Relaxed),
            file_path: self.path.clone(),
            file_size_bytes,
            data_gaps: self.gaps.load(Ordering::Relaxed),
            status,
        }
    }
}

struct ActiveRecording {
    info: SessionInfo,
    stop_tx: Sender<()>,
    done_rx: Receiver<WorkerExit>,
    handle: JoinHandle<()>,
}

/// Recording lifecycle manager.
///
/// Owned by the application thread; the worker thread only sees the ring
/// buffer and its own writer.
pub struct RecorderManager {
    buffer: Arc<RingBuffer>,
    settings: RecorderSettings,
    device: DeviceInfo,
    active: Option<ActiveRecording>,
}

impl RecorderManager {
    /// Create a manager writing under `settings.root_dir` (created if missing)
    pub fn new(buffer: Arc<RingBuffer>, settings: RecorderSettings) -> Result<Self, RecordingError> {
        fs::create_dir_all(&settings.root_dir)
            .map_err(|e| RecordingError::io(&settings.root_dir, e))?;

        Ok(Self {
            buffer,
            settings,
            device: DeviceInfo::default(),
            active: None,
        })
    }

    pub fn with_device_info(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }

    pub fn root_dir(&self) -> &Path {
        &self.settings.root_dir
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn status(&self) -> Option<RecordingStatus> {
        self.active.as_ref().map(|a| a.info.status())
    }

    /// Start a new session named `<prefix>_YYYYMMDD_HHMMSS`.
    ///
    /// Recording begins at the oldest sample still in the buffer.
    pub fn start(&mut self, prefix: Option<&str>) -> Result<RecordingStatus, RecordingError> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }

        let now = Local::now();
        let dir = self.settings.root_dir.join(now.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&dir).map_err(|e| RecordingError::io(&dir, e))?;

        let prefix = prefix.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PREFIX);
        let path = unique_path(&dir, prefix, now);
        let session_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let samples = Arc::new(AtomicU64::new(0));
        let gaps = Arc::new(AtomicU32::new(0));
        let writer = RecordFileWriter::create(&path, self.settings.flush_rows, samples.clone())?;

        let start = self.buffer.snapshot();
        let worker = Worker {
            buffer: self.buffer.clone(),
            writer,
            backlog: start.records,
            next_index: start.next_index,
            gaps: gaps.clone(),
            poll_interval: self.settings.poll_interval,
        };
        let (stop_tx, stop_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);

        let handle = match thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || worker.run(stop_rx, done_tx))
        {
            Ok(handle) => handle,
            Err(e) => {
                // The unspawned closure owned the writer, so the file is closed
                let _ = fs::remove_file(&path);
                return Err(RecordingError::io(&path, e));
            }
        };

        log::info!("Recording started: {}", path.display());
        let info = SessionInfo {
            session_id,
            path,
            start_time: now.with_timezone(&Utc),
            started: Instant::now(),
            samples,
            gaps,
        };
        let status = info.status();
        self.active = Some(ActiveRecording {
            info,
            stop_tx,
            done_rx,
            handle,
        });
        Ok(status)
    }

    /// Stop the active session, finalize its file and write its metadata.
    ///
    /// The manager is idle afterwards even when this returns an error.
    pub fn stop(&mut self) -> Result<RecordingSession, RecordingError> {
        let ActiveRecording {
            info,
            stop_tx,
            done_rx,
            handle,
        } = self.active.take().ok_or(RecordingError::NotRecording)?;

        log::info!("Stopping recording: {}", info.session_id);
        let _ = stop_tx.send(());

        let exit = match done_rx.recv_timeout(self.settings.stop_timeout) {
            Ok(exit) => exit,
            Err(RecvTimeoutError::Timeout) => {
                log::error!(
                    "Recording worker did not stop within {:.1}s, abandoning it",
                    self.settings.stop_timeout.as_secs_f64()
                );
                self.record_failure(&info);
                return Err(RecordingError::WorkerTimeout(self.settings.stop_timeout));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                self.record_failure(&info);
                return Err(RecordingError::Worker(
                    "worker exited without handing back the file".to_string(),
                ));
            }
        };
        if handle.join().is_err() {
            log::warn!("Recording worker panicked after finishing");
        }

        let WorkerExit { mut writer, error } = exit;
        let finished = match error {
            Some(e) => Err(e),
            None => writer.finish(),
        };
        drop(writer);

        match finished {
            Ok(file_size) => {
                let session = info.finish(SessionStatus::Completed, file_size);
                self.write_metadata(&session)?;
                log::info!(
                    "Recording stopped: {} samples in {:.1}s ({} gaps)",
                    session.total_samples,
                    session.duration_seconds,
                    session.data_gaps
                );
                Ok(session)
            }
            Err(e) => {
                self.record_failure(&info);
                Err(e)
            }
        }
    }

    fn record_failure(&self, info: &SessionInfo) {
        let size = fs::metadata(&info.path).map(|m| m.len()).unwrap_or(0);
        let session = info.finish(SessionStatus::Failed, size);
        if let Err(e) = self.write_metadata(&session) {
            log::error!("Could not write metadata for failed session: {}", e);
        }
    }

    fn write_metadata(&self, session: &RecordingSession) -> Result<PathBuf, RecordingError> {
        let path = metadata_path(&session.file_path);
        let metadata = SessionMetadata {
            session: session.clone(),
            average_sample_rate_hz: session.average_sample_rate_hz(),
            device_info: self.device.clone(),
            recording_settings: SettingsSnapshot {
                flush_rows: self.settings.flush_rows,
                poll_interval_ms: self.settings.poll_interval.as_millis() as u64,
                buffer_capacity: self.buffer.capacity(),
            },
        };

        let json = serde_json::to_string_pretty(&metadata).map_err(RecordingError::Metadata)?;
        fs::write(&path, json).map_err(|e| RecordingError::io(&path, e))?;
        Ok(path)
    }

    /// Completed sessions under the root directory, newest first
    pub fn list_recordings(&self, limit: usize) -> Result<Vec<RecordingSession>, RecordingError> {
        let mut sessions = Vec::new();
        collect_sessions(&self.settings.root_dir, &mut sessions)?;

        sessions.retain(|s| s.status == SessionStatus::Completed);
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions.truncate(limit);
        Ok(sessions)
    }
}

impl Drop for RecorderManager {
    fn drop(&mut self) {
        // Ensure recording is stopped
        if self.active.is_some() {
            if let Err(e) = self.stop() {
                log::error!("Failed to stop recording on shutdown: {}", e);
            }
        }
    }
}

fn unique_path(dir: &Path, prefix: &str, now: DateTime<Local>) -> PathBuf {
    let stem = format!("{}_{}", prefix, now.format("%Y%m%d_%H%M%S"));
    let mut candidate = dir.join(format!("{}.csv", stem));
    let mut suffix = 1;
    while candidate.exists() || metadata_path(&candidate).exists() {
        candidate = dir.join(format!("{}_{}.csv", stem, suffix));
        suffix += 1;
    }
    candidate
}

fn collect_sessions(dir: &Path, out: &mut Vec<RecordingSession>) -> Result<(), RecordingError> {
    let entries = fs::read_dir(dir).map_err(|e| RecordingError::io(dir, e))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Err(e) = collect_sessions(&path, out) {
                log::warn!("Skipping unreadable directory: {}", e);
            }
            continue;
        }

        let is_metadata = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".meta.json"));
        if !is_metadata {
            continue;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<SessionMetadata>(&text).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(metadata) => out.push(metadata.session),
            Err(e) => log::warn!("Skipping metadata {}: {}", path.display(), e),
        }
    }
    Ok(())
}
