//! Per-run context threaded through the engine.
//!
//! Each run owns `<output_root>/<run_id>/` exclusively. Nothing here is
//! global: two runs in one process get two independent contexts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLog, AuditResult};

pub const RUN_TAPE: &str = "audit/run_tape.jsonl";
pub const CHECKSUMS: &str = "audit/checksums.json";
pub const SANDBOX_PROOF: &str = "audit/sandbox_proof.json";
pub const EXECUTION_SUMMARY: &str = "reports/execution_summary.json";
pub const PATCHES_DIR: &str = "patches";

/// Directory layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.root.join(PATCHES_DIR)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn run_tape(&self) -> PathBuf {
        self.root.join(RUN_TAPE)
    }

    pub fn checksums(&self) -> PathBuf {
        self.root.join(CHECKSUMS)
    }

    pub fn sandbox_proof(&self) -> PathBuf {
        self.root.join(SANDBOX_PROOF)
    }

    pub fn execution_summary(&self) -> PathBuf {
        self.root.join(EXECUTION_SUMMARY)
    }

    fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [self.audit_dir(), self.patches_dir(), self.reports_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub execution_request_id: String,
    pub repo_id: String,
    pub layout: RunLayout,
    pub audit: Arc<AuditLog>,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    /// Create the run directory tree under `output_root` and open its tape.
    pub fn create(
        output_root: &Path,
        execution_request_id: &str,
        repo_id: &str,
    ) -> AuditResult<Self> {
        let run_id = Uuid::new_v4();
        let layout = RunLayout::new(output_root.join(run_id.to_string()));
        layout.create_dirs()?;
        let audit = Arc::new(AuditLog::open(layout.run_tape())?);
        Ok(Self {
            run_id,
            execution_request_id: execution_request_id.to_string(),
            repo_id: repo_id.to_string(),
            layout,
            audit,
            started_at: Utc::now(),
        })
    }

    pub fn run_id_str(&self) -> String {
        self.run_id.to_string()
    }

    /// Append to this run's tape.
    pub fn record(&self, event_type: &str, details: Value) -> AuditResult<AuditEvent> {
        self.audit.append(event_type, details)
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from((Utc::now() - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}
