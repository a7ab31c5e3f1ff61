//! Data model shared by the planner, validator and engine.

pub mod intent;
pub mod plan;
pub mod request;
pub mod risk;

pub use intent::{ExecutionIntent, IntentRisk, IntentScope, PlannedCommand, ScopeTargets};
pub use plan::{
    CommitPlan, CommitStep, DryExecutionResult, ExecutionGraph, GraphEdge, GraphNode, Lineage,
    PatchFile, PatchPlan, ReviewPackStub, RiskSummary,
};
pub use request::{ExecutionMode, ExecutionRequest, RepoTarget, REQUEST_SCHEMA_VERSION};
pub use risk::RiskTier;
