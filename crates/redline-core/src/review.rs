//! External human-approval gate for high-risk requests.
//!
//! Approvals live in `approvals.jsonl` under the review directory, one
//! [`ApprovalRecord`] per line, appended and never rewritten. The engine only
//! reads them; `redline approve` is the writer.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionRequest, RiskTier};

pub const APPROVALS_FILE: &str = "approvals.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("approver must not be empty")]
    EmptyApprover,

    #[error("execution request id must not be empty")]
    EmptyRequestId,

    #[error("review store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed approval record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("approval serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ReviewResult<T> = std::result::Result<T, ReviewError>;

/// One recorded human approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub execution_request_id: String,
    /// Who approved (operator identifier).
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReviewGate {
    review_dir: PathBuf,
}

impl ReviewGate {
    pub fn new(review_dir: impl AsRef<Path>) -> Self {
        Self {
            review_dir: review_dir.as_ref().to_path_buf(),
        }
    }

    pub fn review_dir(&self) -> &Path {
        &self.review_dir
    }

    fn approvals_path(&self) -> PathBuf {
        self.review_dir.join(APPROVALS_FILE)
    }

    /// Whether `request` must carry an approval before apply.
    ///
    /// The request's own flags can only raise the requirement. The review
    /// stub of the embedded dry run and the risk declared by the embedded
    /// intent are consulted as well, so clearing the top-level flags does not
    /// skip review.
    pub fn requires_review(&self, request: &ExecutionRequest) -> bool {
        if request.requires_review || request.risk.requires_approval() {
            return true;
        }
        let stub_requires = request.dry_run.as_ref().is_some_and(|dry| {
            !dry.review_pack_stub.requires_review.is_empty()
                || dry.review_pack_stub.risk_summary.dominant_risk.requires_approval()
        });
        let intent_requires = request.intent.as_ref().is_some_and(|intent| {
            intent.risk.overall.requires_approval()
                || intent
                    .planned_commands
                    .iter()
                    .any(|c| c.risk.is_some_and(RiskTier::requires_approval))
        });
        stub_requires || intent_requires
    }

    /// The first approval recorded for `execution_request_id`, if any.
    pub fn check_approval(&self, execution_request_id: &str) -> ReviewResult<Option<ApprovalRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .find(|r| r.execution_request_id == execution_request_id))
    }

    /// Record an approval. Approving twice as the same approver returns the
    /// existing record unchanged.
    pub fn approve(
        &self,
        execution_request_id: &str,
        approver: &str,
        note: Option<String>,
    ) -> ReviewResult<ApprovalRecord> {
        self.approve_at(execution_request_id, approver, note, Utc::now())
    }

    pub fn approve_at(
        &self,
        execution_request_id: &str,
        approver: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> ReviewResult<ApprovalRecord> {
        if execution_request_id.trim().is_empty() {
            return Err(ReviewError::EmptyRequestId);
        }
        if approver.trim().is_empty() {
            return Err(ReviewError::EmptyApprover);
        }
        if let Some(existing) = self.records()?.into_iter().find(|r| {
            r.execution_request_id == execution_request_id && r.approver == approver
        }) {
            return Ok(existing);
        }

        let record = ApprovalRecord {
            execution_request_id: execution_request_id.to_string(),
            approver: approver.to_string(),
            note,
            approved_at: now,
        };
        std::fs::create_dir_all(&self.review_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.approvals_path())?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        tracing::info!(
            execution_request_id = %record.execution_request_id,
            approver = %record.approver,
            "approval recorded"
        );
        Ok(record)
    }

    /// Every approval on file, in recording order.
    pub fn records(&self) -> ReviewResult<Vec<ApprovalRecord>> {
        let file = match std::fs::File::open(self.approvals_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|source| ReviewError::Malformed {
                line: idx + 1,
                source,
            })?;
            out.push(record);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionIntent, ExecutionMode, RepoTarget};
    use crate::planner;

    fn request(requires_review: bool, risk: RiskTier) -> ExecutionRequest {
        let mut req = ExecutionRequest::from_json(
            r#"{
                "execution_request_id": "req-1",
                "schema_version": "1.0",
                "repo": {"repo_id": "r", "path": "/tmp/r", "base_commit": "HEAD"}
            }"#,
        )
        .unwrap();
        req.requires_review = requires_review;
        req.risk = risk;
        req
    }

    #[test]
    fn review_required_by_flag_or_risk() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ReviewGate::new(dir.path());
        assert!(!gate.requires_review(&request(false, RiskTier::Low)));
        assert!(!gate.requires_review(&request(false, RiskTier::Medium)));
        assert!(gate.requires_review(&request(true, RiskTier::Low)));
        assert!(gate.requires_review(&request(false, RiskTier::High)));
        assert!(gate.requires_review(&request(false, RiskTier::Critical)));
    }

    fn planned(command_risk: Option<RiskTier>) -> ExecutionRequest {
        let mut intent = ExecutionIntent::from_json(
            r#"{
                "intent_id": "intent-1",
                "planned_commands": [
                    {"command_id": "c1", "action": "write_file", "path": "src/a.py",
                     "content": "x\n", "evidence_refs": ["src/a.py"]}
                ]
            }"#,
        )
        .unwrap();
        intent.planned_commands[0].risk = command_risk;
        let dry = planner::dry_run(&intent, Vec::new()).unwrap();
        ExecutionRequest::from_dry_run(
            "req-1",
            RepoTarget {
                repo_id: "r".into(),
                path: "/tmp/r".into(),
                base_commit: "HEAD".into(),
            },
            ExecutionMode::Apply,
            dry,
            Some(intent),
        )
    }

    #[test]
    fn cleared_request_flags_do_not_hide_planned_risk() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ReviewGate::new(dir.path());

        let mut req = planned(Some(RiskTier::High));
        req.requires_review = false;
        req.risk = RiskTier::Low;
        assert!(gate.requires_review(&req));

        // Stub forged too: the intent still declares the risk.
        let dry = req.dry_run.as_mut().unwrap();
        dry.review_pack_stub.requires_review.clear();
        dry.review_pack_stub.risk_summary.dominant_risk = RiskTier::Low;
        assert!(gate.requires_review(&req));

        // Without an intent the stub alone is enough.
        let mut stub_only = planned(Some(RiskTier::Critical));
        stub_only.requires_review = false;
        stub_only.risk = RiskTier::Low;
        stub_only.intent = None;
        assert!(gate.requires_review(&stub_only));

        assert!(!gate.requires_review(&planned(Some(RiskTier::Medium))));
    }

    #[test]
    fn missing_store_means_no_approval() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ReviewGate::new(dir.path().join("never-created"));
        assert!(gate.check_approval("req-1").unwrap().is_none());
    }

    #[test]
    fn approve_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ReviewGate::new(dir.path());
        gate.approve("req-1", "alice", Some("looks fine".into())).unwrap();

        let found = gate.check_approval("req-1").unwrap().unwrap();
        assert_eq!(found.approver, "alice");
        assert_eq!(found.note.as_deref(), Some("looks fine"));
        assert!(gate.check_approval("req-2").unwrap().is_none());
    }

    #[test]
    fn approve_is_idempotent_per_approver() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ReviewGate::new(dir.path());
        let first = gate.approve("req-1", "alice", None).unwrap();
        let again = gate.approve("req-1", "alice", Some("ignored".into())).unwrap();
        assert_eq!(first, again);
        gate.approve("req-1", "bob", None).unwrap();
        assert_eq!(gate.records().unwrap().len(), 2);
    }

    #[test]
    fn empty_approver_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gate = ReviewGate::new(dir.path());
        assert!(matches!(
            gate.approve("req-1", "  ", None),
            Err(ReviewError::EmptyApprover)
        ));
        assert!(gate.records().unwrap().is_empty());
    }
}
