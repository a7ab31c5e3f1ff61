//! Run reports persisted next to the audit tape.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::{sha256_file, AtomicResult, AtomicWriteError};
use crate::error::ExecutionStatus;

/// `reports/execution_summary.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_request_id: String,
    pub run_id: String,
    pub status: ExecutionStatus,
    pub commit_count: usize,
    pub patch_count: usize,
    pub sandbox_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `audit/checksums.json`: SHA-256 of every run artifact, keyed by its path
/// relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub generated_at: DateTime<Utc>,
    pub files: BTreeMap<String, String>,
}

impl Checksums {
    /// Hash each of `relative` under `run_dir`. Missing files are skipped.
    pub fn collect<'a>(
        run_dir: &Path,
        relative: impl IntoIterator<Item = &'a str>,
    ) -> AtomicResult<Self> {
        let mut files = BTreeMap::new();
        for rel in relative {
            let path = run_dir.join(rel);
            if !path.exists() {
                continue;
            }
            let digest = sha256_file(&path).map_err(|source| AtomicWriteError::Io {
                path: path.clone(),
                source,
            })?;
            files.insert(rel.to_string(), digest);
        }
        Ok(Self {
            generated_at: Utc::now(),
            files,
        })
    }

    /// Entries whose file no longer hashes to the recorded value.
    pub fn mismatches(&self, run_dir: &Path) -> Vec<String> {
        self.files
            .iter()
            .filter(|(rel, digest)| {
                sha256_file(&run_dir.join(rel.as_str()))
                    .map(|actual| &actual != *digest)
                    .unwrap_or(true)
            })
            .map(|(rel, _)| rel.clone())
            .collect()
    }
}
