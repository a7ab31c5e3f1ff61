//! Engine configuration.
//!
//! Defaults keep every run artifact under the system temp dir. Each knob can
//! be overridden from the environment:
//! - REDLINE_OUTPUT_ROOT (run directories)
//! - REDLINE_LOCK_DIR (execution lock rows)
//! - REDLINE_REVIEW_DIR (approvals.jsonl)
//! - REDLINE_WORKTREE_ROOT (parent of sandbox worktrees; default is the run dir)
//! - REDLINE_MAX_CONCURRENCY (default 4)
//! - REDLINE_LOCK_TTL_SECS (default 3600)
//! - REDLINE_COMMIT_NAME / REDLINE_COMMIT_EMAIL (sandbox commit identity)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::git::CommitIdentity;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub output_root: PathBuf,
    pub lock_dir: PathBuf,
    pub review_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,
    pub max_concurrency: usize,
    pub lock_ttl_secs: u64,
    pub commit_identity: CommitIdentity,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("redline");
        Self {
            output_root: base.join("runs"),
            lock_dir: base.join("locks"),
            review_dir: base.join("review"),
            worktree_root: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            commit_identity: CommitIdentity::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `REDLINE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    /// Unparseable numbers keep the default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = lookup("REDLINE_OUTPUT_ROOT") {
            cfg.output_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("REDLINE_LOCK_DIR") {
            cfg.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("REDLINE_REVIEW_DIR") {
            cfg.review_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("REDLINE_WORKTREE_ROOT") {
            cfg.worktree_root = Some(PathBuf::from(v));
        }
        if let Some(n) = parse_number::<usize>("REDLINE_MAX_CONCURRENCY", lookup("REDLINE_MAX_CONCURRENCY")) {
            cfg.max_concurrency = n.max(1);
        }
        if let Some(n) = parse_number::<u64>("REDLINE_LOCK_TTL_SECS", lookup("REDLINE_LOCK_TTL_SECS")) {
            cfg.lock_ttl_secs = n;
        }
        if let Some(v) = lookup("REDLINE_COMMIT_NAME") {
            cfg.commit_identity.name = v;
        }
        if let Some(v) = lookup("REDLINE_COMMIT_EMAIL") {
            cfg.commit_identity.email = v;
        }
        cfg
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable numeric setting");
            None
        }
    }
}
