//! Append-only per-run audit tape (`audit/run_tape.jsonl`).
//!
//! Events carry a monotonically increasing `seq` assigned under the writer
//! lock, so the on-disk order is the emission order. Lines are never
//! rewritten; the finished tape is sealed with an integrity marker by the
//! engine.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::obs;

/// Event type names written to the tape.
pub mod event {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FAILED: &str = "run.failed";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const LOCK_ACQUIRED: &str = "lock.acquired";
    pub const LOCK_CONTENTION: &str = "lock.contention";
    pub const LOCK_RELEASED: &str = "lock.released";
    pub const RED_LINE_EVALUATED: &str = "red_line.evaluated";
    pub const REVIEW_CHECKED: &str = "review.checked";
    pub const POLICY_CHECKED: &str = "policy.checked";
    pub const POLICY_DENIED: &str = "policy.denied";
    pub const OPERATION_STATE: &str = "operation.state";
    pub const DIFF_VERIFIED: &str = "diff.verified";
    pub const SANDBOX_CREATED: &str = "sandbox.created";
    pub const SANDBOX_REMOVED: &str = "sandbox.removed";
    pub const COMMIT_CREATED: &str = "commit.created";
    pub const PATCHES_APPLIED: &str = "patches.applied";
    pub const PROOF_RECORDED: &str = "proof.recorded";
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("audit writer lock poisoned")]
    Poisoned,

    #[error("malformed audit line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

pub type AuditResult<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub event_type: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

struct TapeWriter {
    file: File,
    next_seq: u64,
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<TapeWriter>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}

impl AuditLog {
    /// Open (or create) the tape at `path` for appending.
    ///
    /// Sequence numbers continue after any events already on the tape.
    pub fn open(path: impl AsRef<Path>) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let next_seq = if path.exists() {
            read_events(&path)?.last().map_or(0, |e| e.seq + 1)
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(TapeWriter { file, next_seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush it to stable storage before returning.
    pub fn append(&self, event_type: &str, details: Value) -> AuditResult<AuditEvent> {
        let mut writer = self.writer.lock().map_err(|_| AuditError::Poisoned)?;
        let event = AuditEvent {
            seq: writer.next_seq,
            event_type: event_type.to_string(),
            details,
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        writer.file.write_all(&line)?;
        writer.file.flush()?;
        writer.file.sync_data()?;
        writer.next_seq += 1;
        obs::emit_audit_appended(event_type, event.seq);
        Ok(event)
    }

    /// Number of events appended so far, including pre-existing ones.
    pub fn len(&self) -> AuditResult<u64> {
        Ok(self.writer.lock().map_err(|_| AuditError::Poisoned)?.next_seq)
    }

    pub fn is_empty(&self) -> AuditResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Read every event from a tape file.
pub fn read_events(path: impl AsRef<Path>) -> AuditResult<Vec<AuditEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: AuditEvent =
            serde_json::from_str(&line).map_err(|e| AuditError::Malformed {
                line: idx + 1,
                reason: e.to_string(),
            })?;
        events.push(event);
    }
    Ok(events)
}
