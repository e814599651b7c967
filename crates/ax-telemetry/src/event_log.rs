//! Append-only JSON Lines event log.
//!
//! One record per line; records are never mutated after being written.
//! Rotation happens by opening a new epoch-stamped file, never by rewriting.
//! Write failures are swallowed with a WARN -- persistence must never fail a
//! task.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// ISO-8601 wall-clock timestamp.
    pub timestamp: String,
    /// Microseconds since the epoch, for sub-millisecond ordering.
    pub timestamp_micro: i64,
    pub task_id: Option<u64>,
    pub worker_id: Option<String>,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventRecord {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now.to_rfc3339(),
            timestamp_micro: now.timestamp_micros(),
            task_id: None,
            worker_id: None,
            event: event.into(),
            payload,
        }
    }

    pub fn with_task(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

/// Append-only writer over epoch-stamped JSONL files in one directory.
pub struct EventLog {
    dir: PathBuf,
    writer: Mutex<Option<LogFile>>,
}

struct LogFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl EventLog {
    /// Create an event log rooted at `dir`. The directory is created lazily
    /// on first append; a missing directory is not an error here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writer: Mutex::new(None),
        }
    }

    /// Append one record. Failures are logged and swallowed.
    pub fn append(&self, record: &EventRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "event log serialisation failed");
                return;
            }
        };

        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            match self.open_new_file() {
                Ok(file) => *guard = Some(file),
                Err(e) => {
                    warn!(error = %e, dir = %self.dir.display(), "event log open failed");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if let Err(e) = writeln!(file.out, "{line}").and_then(|_| file.out.flush()) {
                warn!(error = %e, path = %file.path.display(), "event log write failed");
            }
        }
    }

    /// Start a new epoch-stamped file; subsequent appends go there.
    pub fn rotate(&self) {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match self.open_new_file() {
            Ok(file) => *guard = Some(file),
            Err(e) => warn!(error = %e, "event log rotation failed"),
        }
    }

    /// Path of the file currently being written, if any.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|f| f.path.clone())
    }

    fn open_new_file(&self) -> std::io::Result<LogFile> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("events-{}.jsonl", Utc::now().timestamp_millis()));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(LogFile {
            path,
            out: BufWriter::new(file),
        })
    }
}

/// Read every record from a JSONL file, skipping unparseable lines.
pub fn read_records(path: &Path) -> Vec<EventRecord> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());

        log.append(&EventRecord::new("request_received", json!({"tool": "spawn"})).with_task(42));
        log.append(&EventRecord::new("execution_started", json!({})).with_task(42));

        let path = log.current_path().unwrap();
        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "request_received");
        assert_eq!(records[0].task_id, Some(42));
        assert!(records[0].timestamp_micro <= records[1].timestamp_micro);
    }

    #[test]
    fn rotation_switches_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());

        log.append(&EventRecord::new("a", json!({})));
        let first = log.current_path().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        log.rotate();
        log.append(&EventRecord::new("b", json!({})));
        let second = log.current_path().unwrap();

        assert_ne!(first, second);
        assert_eq!(read_records(&first).len(), 1);
        assert_eq!(read_records(&second).len(), 1);
    }

    #[test]
    fn append_to_unwritable_dir_is_swallowed() {
        let log = EventLog::new("/proc/definitely/not/writable");
        // Must not panic or error out.
        log.append(&EventRecord::new("x", json!({})));
        assert!(log.current_path().is_none());
    }

    #[test]
    fn record_builder_sets_fields() {
        let r = EventRecord::new("ev", json!({"k": 1}))
            .with_task(7)
            .with_worker("w-1");
        assert_eq!(r.task_id, Some(7));
        assert_eq!(r.worker_id.as_deref(), Some("w-1"));
        assert_eq!(r.payload["k"], 1);
    }
}
