//! Audit sink - records surfaced errors and notable admin actions
//!
//! `JsonlAuditLog` appends one JSON object per line to the configured file
//! and mirrors every event through tracing.

use crate::domain::error::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    /// Component that raised the event (`cache`, `mutator`, `pipeline`, ...)
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Entity the event is about (vehicle id, row number, collection name)
    pub subject: String,
    pub message: String,
}

impl AuditEvent {
    pub fn error(
        source: &'static str,
        kind: ErrorKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            source,
            kind: Some(kind),
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn info(
        source: &'static str,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            source,
            kind: None,
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Destination for audit events; `record` must not block on IO for long
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

fn trace_event(event: &AuditEvent) {
    match event.kind {
        Some(kind) => warn!(
            source = %event.source,
            kind = %kind,
            subject = %event.subject,
            message = %event.message,
            "audit_error"
        ),
        None => info!(
            source = %event.source,
            subject = %event.subject,
            message = %event.message,
            "audit_event"
        ),
    }
}

/// Audit sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        trace_event(&event);
    }
}

/// Append-only JSON lines audit file
pub struct JsonlAuditLog {
    file_path: PathBuf,
    /// Serializes appends from concurrent tasks
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "audit_log_initialized");
        Self { file_path, write_lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path.display(), bytes = %line.len(), "audit_written");
        Ok(())
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: AuditEvent) {
        trace_event(&event);
        if let Err(e) = self.append_line(&event.to_json()) {
            error!(file = %self.file_path.display(), error = %e, "audit_write_failed");
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn count_from(&self, source: &str) -> usize {
        self.events.lock().iter().filter(|e| e.source == source).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        trace_event(&event);
        self.events.lock().push(event);
    }
}
