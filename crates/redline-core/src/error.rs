//! Engine-level error taxonomy and run status codes.

use serde::{Deserialize, Serialize};

use crate::atomic::AtomicWriteError;
use crate::audit::AuditError;
use crate::git::GitError;
use crate::lock::LockError;
use crate::planner::PlanError;
use crate::policy::PolicyError;
use crate::proof::ProofError;
use crate::redline::RedLineReport;
use crate::review::ReviewError;
use crate::sandbox::SandboxError;
use crate::scheduler::SchedulerError;

/// Final status of a run. Doubles as the CLI exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    OperationFailed,
    SchemaError,
    PolicyDenied,
    RedLineViolation,
    LockContention,
    Timeout,
    ReviewRequired,
    CycleDetected,
    CorruptionDetected,
    ProofMismatch,
    SandboxError,
    InternalError,
}

impl ExecutionStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::OperationFailed => 1,
            Self::SchemaError => 2,
            Self::PolicyDenied => 3,
            Self::RedLineViolation => 4,
            Self::LockContention => 5,
            Self::Timeout => 6,
            Self::ReviewRequired => 7,
            Self::CycleDetected => 8,
            Self::CorruptionDetected => 9,
            Self::ProofMismatch => 10,
            Self::SandboxError => 11,
            Self::InternalError => 70,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::OperationFailed => "operation_failed",
            Self::SchemaError => "schema_error",
            Self::PolicyDenied => "policy_denied",
            Self::RedLineViolation => "red_line_violation",
            Self::LockContention => "lock_contention",
            Self::Timeout => "timeout",
            Self::ReviewRequired => "review_required",
            Self::CycleDetected => "cycle_detected",
            Self::CorruptionDetected => "corruption_detected",
            Self::ProofMismatch => "proof_mismatch",
            Self::SandboxError => "sandbox_error",
            Self::InternalError => "internal_error",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    AtomicWrite(#[from] AtomicWriteError),

    #[error("proof failed: {0}")]
    Proof(#[from] ProofError),

    #[error("execution lock error: {0}")]
    Lock(#[from] LockError),

    #[error("review store error: {0}")]
    Review(#[from] ReviewError),

    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid execution request: {0}")]
    InvalidRequest(String),

    #[error("red-line violations: {}", .report.summary())]
    RedLineViolation { report: Box<RedLineReport> },

    #[error("dry run checksum does not match its plans")]
    ChecksumMismatch,

    #[error("repository {repo_id} is locked by run {}", .holder.as_deref().unwrap_or("unknown"))]
    LockContention {
        repo_id: String,
        holder: Option<String>,
    },

    #[error("execution request {execution_request_id} requires an approval")]
    ReviewRequired { execution_request_id: String },

    #[error("run deadline exceeded; timed out operations: {}", .failed.join(", "))]
    Timeout { failed: Vec<String> },

    #[error("operations failed: {}", .failed.join(", "))]
    OperationFailed { failed: Vec<String> },
}

impl EngineError {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Policy(PolicyError::Denied { .. }) => ExecutionStatus::PolicyDenied,
            Self::Policy(PolicyError::Read { .. }) => ExecutionStatus::InternalError,
            Self::Policy(_) => ExecutionStatus::SchemaError,
            Self::Plan(PlanError::Checksum(_)) => ExecutionStatus::InternalError,
            Self::Plan(_) => ExecutionStatus::SchemaError,
            Self::Scheduler(SchedulerError::Cycle { .. }) => ExecutionStatus::CycleDetected,
            Self::Scheduler(SchedulerError::IllegalTransition { .. }) => {
                ExecutionStatus::InternalError
            }
            Self::Scheduler(_) => ExecutionStatus::SchemaError,
            Self::Sandbox(_) => ExecutionStatus::SandboxError,
            Self::AtomicWrite(AtomicWriteError::Io { .. }) => ExecutionStatus::InternalError,
            Self::AtomicWrite(_) => ExecutionStatus::CorruptionDetected,
            Self::Proof(_) => ExecutionStatus::ProofMismatch,
            Self::Git(_) => ExecutionStatus::OperationFailed,
            Self::Lock(_)
            | Self::Review(_)
            | Self::Audit(_)
            | Self::Io(_)
            | Self::Serialization(_) => ExecutionStatus::InternalError,
            Self::InvalidRequest(_) => ExecutionStatus::SchemaError,
            Self::RedLineViolation { .. } => ExecutionStatus::RedLineViolation,
            Self::ChecksumMismatch => ExecutionStatus::CorruptionDetected,
            Self::LockContention { .. } => ExecutionStatus::LockContention,
            Self::ReviewRequired { .. } => ExecutionStatus::ReviewRequired,
            Self::Timeout { .. } => ExecutionStatus::Timeout,
            Self::OperationFailed { .. } => ExecutionStatus::OperationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        let expected = [
            (ExecutionStatus::Success, 0),
            (ExecutionStatus::OperationFailed, 1),
            (ExecutionStatus::SchemaError, 2),
            (ExecutionStatus::PolicyDenied, 3),
            (ExecutionStatus::RedLineViolation, 4),
            (ExecutionStatus::LockContention, 5),
            (ExecutionStatus::Timeout, 6),
            (ExecutionStatus::ReviewRequired, 7),
            (ExecutionStatus::CycleDetected, 8),
            (ExecutionStatus::CorruptionDetected, 9),
            (ExecutionStatus::ProofMismatch, 10),
            (ExecutionStatus::SandboxError, 11),
            (ExecutionStatus::InternalError, 70),
        ];
        for (status, code) in expected {
            assert_eq!(status.exit_code(), code, "{status}");
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::RedLineViolation).unwrap();
        assert_eq!(json, "\"red_line_violation\"");
    }

    #[test]
    fn errors_map_to_statuses() {
        let cycle = EngineError::from(SchedulerError::Cycle {
            ops: vec!["a".into(), "b".into()],
        });
        assert_eq!(cycle.status(), ExecutionStatus::CycleDetected);

        let denied = EngineError::from(PolicyError::Denied {
            operation: "rm_rf".into(),
            reason: "operation not allowlisted".into(),
        });
        assert_eq!(denied.status(), ExecutionStatus::PolicyDenied);

        let schema = EngineError::from(PolicyError::Schema { errors: vec![] });
        assert_eq!(schema.status(), ExecutionStatus::SchemaError);

        let contention = EngineError::LockContention {
            repo_id: "repo_x".into(),
            holder: Some("run-1".into()),
        };
        assert_eq!(contention.status(), ExecutionStatus::LockContention);
        assert!(contention.to_string().contains("run-1"));
    }
}
