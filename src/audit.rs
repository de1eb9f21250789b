//! Structured audit logging for gateway decisions.
//!
//! Every completed request emits one JSONL entry through a bounded mpsc
//! channel drained by a background writer, so the pipeline never blocks on
//! disk I/O. The sink is an injected handle created at process init — tests
//! construct their own over a temp directory, or a disabled sink that drops
//! everything.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Maximum audit log file size before rotation (50 MB).
const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Bounded channel capacity for non-blocking writes.
const CHANNEL_CAPACITY: usize = 10_000;

/// Audit log file name.
const AUDIT_FILE_NAME: &str = "audit.jsonl";

/// Rotated audit log file name.
const AUDIT_ROTATED_NAME: &str = "audit.jsonl.1";

/// Events tracked by the audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The per-request risk report. `report` is the serialized
    /// [`crate::orchestrator::report::RiskReport`].
    RequestCompleted {
        request_id: String,
        action: String,
        overall_risk_score: f64,
        model: String,
        mode: String,
        report: Value,
    },
    /// A data source config was created or replaced.
    SourceUpserted { name: String, kind: String },
    /// A vault sweep removed expired or revoked records.
    VaultSwept { removed: usize },
}

impl AuditEvent {
    /// Snake-case event name (matches the serde tag).
    pub fn event_name(&self) -> &'static str {
        match self {
            AuditEvent::RequestCompleted { .. } => "request_completed",
            AuditEvent::SourceUpserted { .. } => "source_upserted",
            AuditEvent::VaultSwept { .. } => "vault_swept",
        }
    }
}

/// A single line in the audit JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// RFC 3339 timestamp.
    pub ts: String,
    /// Snake-case event name.
    pub event: String,
    /// Event-specific payload.
    pub data: Value,
}

/// Handle to the audit writer. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
    dir: Option<PathBuf>,
}

impl AuditSink {
    /// Create a sink writing JSONL under `dir`, spawning the writer task.
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let (tx, rx) = mpsc::channel::<AuditEntry>(CHANNEL_CAPACITY);
        let log_path = dir.join(AUDIT_FILE_NAME);
        let rotated_path = dir.join(AUDIT_ROTATED_NAME);
        tokio::spawn(writer_task(rx, log_path, rotated_path));
        Ok(Self {
            tx: Some(tx),
            dir: Some(dir),
        })
    }

    /// A sink that silently drops every event.
    pub fn disabled() -> Self {
        Self { tx: None, dir: None }
    }

    /// Queue an event (non-blocking best-effort).
    pub fn emit(&self, event: AuditEvent) {
        let Some(tx) = &self.tx else { return };
        let entry = AuditEntry {
            ts: Utc::now().to_rfc3339(),
            event: event.event_name().to_string(),
            data: serde_json::to_value(&event).unwrap_or(Value::Null),
        };
        if let Err(e) = tx.try_send(entry) {
            tracing::warn!("audit: channel full or closed, dropping event: {e}");
        }
    }

    /// Tail-read the most recent entries, oldest first.
    pub fn recent_entries(&self, limit: usize) -> Vec<AuditEntry> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        read_tail_entries(&dir.join(AUDIT_FILE_NAME), limit)
    }
}

async fn writer_task(mut rx: mpsc::Receiver<AuditEntry>, log_path: PathBuf, rotated_path: PathBuf) {
    while let Some(entry) = rx.recv().await {
        let line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("audit: failed to serialize entry: {e}");
                continue;
            }
        };

        // Rotate before writing when the file is at the cap.
        if let Ok(meta) = fs::metadata(&log_path) {
            if meta.len() >= MAX_FILE_SIZE {
                if let Err(e) = fs::rename(&log_path, &rotated_path) {
                    tracing::error!("audit: rotation rename failed: {e}");
                }
            }
        }

        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .and_then(|mut f| {
                writeln!(f, "{line}")?;
                f.sync_all()
            });

        if let Err(e) = result {
            tracing::error!("audit: failed to write entry: {e}");
        }
    }
}

fn read_tail_entries(path: &PathBuf, limit: usize) -> Vec<AuditEntry> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let reader = BufReader::new(file);
    let mut entries: Vec<AuditEntry> = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
            entries.push(entry);
        }
    }

    if entries.len() > limit {
        entries.split_off(entries.len() - limit)
    } else {
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn completed(request_id: &str) -> AuditEvent {
        AuditEvent::RequestCompleted {
            request_id: request_id.into(),
            action: "allowed".into(),
            overall_risk_score: 0.5,
            model: "gw-large".into(),
            mode: "balanced".into(),
            report: serde_json::json!({"iterations": 0}),
        }
    }

    #[test]
    fn test_event_names_unique() {
        let events = [
            completed("r"),
            AuditEvent::SourceUpserted {
                name: "orders".into(),
                kind: "sqlite".into(),
            },
            AuditEvent::VaultSwept { removed: 3 },
        ];
        let mut names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_event_json_contains_type_tag() {
        let json = serde_json::to_string(&completed("r-1")).unwrap();
        assert!(json.contains("\"type\":\"request_completed\""));
        assert!(json.contains("\"request_id\":\"r-1\""));
    }

    #[test]
    fn test_disabled_sink_is_noop() {
        let sink = AuditSink::disabled();
        sink.emit(completed("r-1"));
        assert!(sink.recent_entries(10).is_empty());
    }

    #[tokio::test]
    async fn test_emit_writes_jsonl() {
        let dir = TempDir::new().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf()).unwrap();
        sink.emit(completed("r-1"));
        sink.emit(AuditEvent::VaultSwept { removed: 1 });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let entries = sink.recent_entries(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, "request_completed");
        assert_eq!(entries[1].event, "vault_swept");
    }

    #[tokio::test]
    async fn test_recent_entries_respects_limit() {
        let dir = TempDir::new().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf()).unwrap();
        for i in 0..5 {
            sink.emit(completed(&format!("r-{i}")));
        }
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;

        let entries = sink.recent_entries(2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data["request_id"], "r-4");
    }

    #[tokio::test]
    async fn test_writer_rotates_large_file() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join(AUDIT_FILE_NAME);
        {
            let mut f = fs::File::create(&log_path).unwrap();
            let chunk = vec![b'x'; 1024 * 1024];
            for _ in 0..51 {
                f.write_all(&chunk).unwrap();
            }
        }
        let sink = AuditSink::new(dir.path().to_path_buf()).unwrap();
        sink.emit(completed("r-after-rotate"));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(dir.path().join(AUDIT_ROTATED_NAME).exists());
        let entries = sink.recent_entries(10);
        assert_eq!(entries.len(), 1);
    }
}
