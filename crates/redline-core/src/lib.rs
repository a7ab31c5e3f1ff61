//! Redline Core Library
//!
//! Execution safety and scheduling: plans evidence-backed change intents,
//! enforces the red-line invariants, applies approved plans inside an
//! isolated git worktree and proves that what landed is what was planned.

pub mod atomic;
pub mod audit;
pub mod config;
pub mod context;
pub mod diff_verify;
pub mod domain;
pub mod engine;
pub mod error;
pub mod git;
pub mod lock;
pub mod obs;
pub mod planner;
pub mod policy;
pub mod proof;
pub mod redline;
pub mod report;
pub mod review;
pub mod sandbox;
pub mod scheduler;
pub mod telemetry;

pub use atomic::{AtomicWriteError, AtomicWriter, IntegrityMarker};
pub use audit::{read_events, AuditError, AuditEvent, AuditLog};
pub use config::EngineConfig;
pub use context::{RunContext, RunLayout};
pub use diff_verify::{render_replacement_diff, DiffVerification, DiffVerifier};
pub use domain::{
    CommitPlan, CommitStep, DryExecutionResult, ExecutionGraph, ExecutionIntent, ExecutionMode,
    ExecutionRequest, GraphEdge, GraphNode, Lineage, PatchFile, PatchPlan, PlannedCommand,
    RepoTarget, RiskTier,
};
pub use engine::{DryRunOutcome, ExecutionResult, ExecutorEngine};
pub use error::{EngineError, ExecutionStatus};
pub use git::CommitIdentity;
pub use lock::{ExecutionLock, FsLockStore, LockError, LockRow, LockStore, MemoryLockStore};
pub use planner::{Plan, PlanError};
pub use policy::{AllowlistPolicy, PathMatcher, PolicyError, SandboxPolicy};
pub use proof::{verify_proof, ProofError, SandboxProof, SelfProvingCommitRecorder};
pub use redline::{RedLineId, RedLineReport, RedLineValidator, Severity, Violation};
pub use report::{Checksums, ExecutionSummary};
pub use review::{ApprovalRecord, ReviewError, ReviewGate};
pub use sandbox::{Sandbox, SandboxError, SandboxOperationRunner, VerifyingRunner};
pub use scheduler::{
    DagScheduler, OpState, Operation, OperationFailure, OperationOutput, OperationRunner,
    RunStatus, SchedulerError, SchedulerOptions, SchedulerReport,
};
