//! Decision audit trail
//!
//! Retrieval outcomes and validation verdicts can be recorded as
//! `AuditRecord`s. Records are queued on a bounded channel and written by a
//! background task, so callers never wait on the sink. A full queue or a
//! failing sink is logged and otherwise ignored.
//!
//! # Example
//!
//! ```rust,no_run
//! use protocol_guard_core::audit::{AuditEmitter, AuditRecord, TracingAuditSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (emitter, worker) = AuditEmitter::spawn(TracingAuditSink, 1_000);
//!     emitter.emit(AuditRecord::new("retrieve", serde_json::json!({"success": true})));
//!     drop(emitter);
//!     worker.join().await;
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::AuditError;

/// A single audited decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Operation that produced the decision
    pub operation: String,
    /// Protocol code or query the decision was about
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// SHA-256 of the subject, for correlating without storing free text
    pub inputs_hash: String,
    pub outcome: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(operation: impl Into<String>, outcome: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            subject: None,
            inputs_hash: hash_inputs(&[]),
            outcome,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        let subject = subject.into();
        self.inputs_hash = hash_inputs(&[&subject]);
        self.subject = Some(subject);
        self
    }

    /// Hash a set of inputs without keeping the subject text
    pub fn with_hashed_inputs(mut self, parts: &[&str]) -> Self {
        self.inputs_hash = hash_inputs(parts);
        self.subject = None;
        self
    }
}

/// Hex SHA-256 over the given parts, in order
pub fn hash_inputs(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Writes each record as a structured tracing event under the `audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let outcome = serde_json::to_string(&record.outcome)?;
        tracing::info!(
            target: "audit",
            id = %record.id,
            operation = %record.operation,
            inputs_hash = %record.inputs_hash,
            outcome = %outcome,
            "decision recorded"
        );
        Ok(())
    }
}

/// Appends records as JSON lines to a file
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Non-blocking handle for queueing audit records
#[derive(Debug, Clone)]
pub struct AuditEmitter {
    sender: mpsc::Sender<AuditRecord>,
}

/// Background writer; finishes once every emitter is dropped
#[derive(Debug)]
pub struct AuditWorker {
    handle: JoinHandle<()>,
}

impl AuditWorker {
    /// Wait until all queued records have been written
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Audit worker terminated abnormally");
        }
    }
}

impl AuditEmitter {
    /// Start the writer task; must be called inside a tokio runtime
    pub fn spawn<S: AuditSink>(sink: S, queue_size: usize) -> (Self, AuditWorker) {
        let (sender, mut receiver) = mpsc::channel::<AuditRecord>(queue_size.max(1));

        let handle = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                if let Err(e) = sink.write(&record).await {
                    tracing::warn!(
                        record_id = %record.id,
                        operation = %record.operation,
                        error = %e,
                        "Failed to write audit record"
                    );
                }
            }
        });

        (Self { sender }, AuditWorker { handle })
    }

    /// Queue a record; drops it with a warning if the queue is full or closed
    pub fn emit(&self, record: AuditRecord) {
        if let Err(e) = self.try_emit(record) {
            tracing::warn!(error = %e, "Audit record dropped");
        }
    }

    pub fn try_emit(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.sender.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::Sink("audit queue full".to_string()),
            mpsc::error::TrySendError::Closed(_) => AuditError::QueueClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<AuditRecord>>>);

    #[async_trait]
    impl AuditSink for MemorySink {
        async fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn write(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Sink("disk full".into()))
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = hash_inputs(&["1210", "epinephrine"]);
        let b = hash_inputs(&["1210", "epinephrine"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        // part boundaries matter
        assert_ne!(hash_inputs(&["12", "10"]), hash_inputs(&["1210"]));
    }

    #[test]
    fn test_subject_sets_hash() {
        let record = AuditRecord::new("retrieve", serde_json::json!({})).with_subject("1210");
        assert_eq!(record.inputs_hash, hash_inputs(&["1210"]));
        assert_eq!(record.subject.as_deref(), Some("1210"));
    }

    #[tokio::test]
    async fn test_emitter_delivers_records() {
        let sink = MemorySink::default();
        let (emitter, worker) = AuditEmitter::spawn(sink.clone(), 16);

        emitter.emit(AuditRecord::new("retrieve", serde_json::json!({"success": true})));
        emitter.emit(AuditRecord::new("search", serde_json::json!({"success": false})));
        drop(emitter);
        worker.join().await;

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, "retrieve");
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let (emitter, worker) = AuditEmitter::spawn(FailingSink, 4);
        emitter.emit(AuditRecord::new("retrieve", serde_json::json!(null)));
        drop(emitter);
        worker.join().await;
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path);

        sink.write(&AuditRecord::new("a", serde_json::json!(1))).await.unwrap();
        sink.write(&AuditRecord::new("b", serde_json::json!(2))).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.operation, "b");
    }
}
