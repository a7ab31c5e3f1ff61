//! Execution requests: the apply-time contract handed to the engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::intent::ExecutionIntent;
use super::plan::{CommitPlan, DryExecutionResult, PatchPlan};
use super::risk::RiskTier;
use crate::scheduler::operation::Operation;

/// Current request document version.
pub const REQUEST_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run every pre-mutation check and stop before the sandbox.
    #[default]
    DryRun,
    Apply,
}

/// The repository a request targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    /// Stable identifier used as the execution lock key.
    pub repo_id: String,
    pub path: PathBuf,
    /// Commit (or any revision git can resolve) the sandbox starts from.
    pub base_commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub execution_request_id: String,
    pub schema_version: String,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Upstream risk assessment flagged this request for review.
    #[serde(default)]
    pub requires_review: bool,
    #[serde(default)]
    pub risk: RiskTier,
    pub repo: RepoTarget,
    #[serde(default)]
    pub patch_plan: PatchPlan,
    #[serde(default)]
    pub commit_plan: CommitPlan,
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// The validated dry run this request was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<DryExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<ExecutionIntent>,
}

impl ExecutionRequest {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Derive an apply request from a dry run.
    ///
    /// Each graph node becomes one operation whose params are the node attrs
    /// and whose dependencies are the node's incoming edges. Review and risk
    /// flags are lifted from the review stub.
    pub fn from_dry_run(
        execution_request_id: impl Into<String>,
        repo: RepoTarget,
        mode: ExecutionMode,
        dry_run: DryExecutionResult,
        intent: Option<ExecutionIntent>,
    ) -> Self {
        let operations = dry_run
            .graph
            .nodes
            .iter()
            .map(|node| Operation {
                op_id: node.node_id.clone(),
                action: node.node_type.clone(),
                params: Value::Object(
                    node.attrs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ),
                depends_on: dry_run.graph.dependencies_of(&node.node_id),
            })
            .collect();
        let dominant = dry_run.review_pack_stub.risk_summary.dominant_risk;

        Self {
            execution_request_id: execution_request_id.into(),
            schema_version: REQUEST_SCHEMA_VERSION.to_string(),
            execution_mode: mode,
            requires_review: !dry_run.review_pack_stub.requires_review.is_empty(),
            risk: dominant,
            repo,
            patch_plan: dry_run.patch_plan.clone(),
            commit_plan: dry_run.commit_plan.clone(),
            operations,
            dry_run: Some(dry_run),
            intent,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::plan::{ExecutionGraph, GraphEdge, GraphNode, ReviewPackStub, RiskSummary};

    fn repo() -> RepoTarget {
        RepoTarget {
            repo_id: "repo_x".into(),
            path: PathBuf::from("/tmp/repo_x"),
            base_commit: "HEAD".into(),
        }
    }

    #[test]
    fn from_dry_run_maps_nodes_to_operations() {
        let mut attrs = BTreeMap::new();
        attrs.insert("path".to_string(), Value::String("src/a.py".into()));
        let dry = DryExecutionResult {
            graph: ExecutionGraph {
                nodes: vec![
                    GraphNode {
                        node_id: "c1".into(),
                        node_type: "write_file".into(),
                        evidence_refs: vec!["ev".into()],
                        attrs: attrs.clone(),
                    },
                    GraphNode {
                        node_id: "c2".into(),
                        node_type: "delete_file".into(),
                        evidence_refs: vec!["ev".into()],
                        attrs,
                    },
                ],
                edges: vec![GraphEdge {
                    from: "c1".into(),
                    to: "c2".into(),
                }],
            },
            review_pack_stub: ReviewPackStub {
                requires_review: vec!["c2".into()],
                risk_summary: RiskSummary {
                    dominant_risk: RiskTier::High,
                },
            },
            ..Default::default()
        };

        let req = ExecutionRequest::from_dry_run("req-1", repo(), ExecutionMode::Apply, dry, None);
        assert_eq!(req.operations.len(), 2);
        assert_eq!(req.operations[0].action, "write_file");
        assert_eq!(req.operations[0].params["path"], "src/a.py");
        assert_eq!(req.operations[1].depends_on, vec!["c1"]);
        assert!(req.requires_review);
        assert_eq!(req.risk, RiskTier::High);
        assert_eq!(req.schema_version, REQUEST_SCHEMA_VERSION);
    }

    #[test]
    fn parses_request_with_defaults() {
        let raw = r#"{
            "execution_request_id": "req-2",
            "schema_version": "1.0",
            "repo": {"repo_id": "r", "path": "/tmp/r", "base_commit": "abc"}
        }"#;
        let req = ExecutionRequest::from_json(raw).unwrap();
        assert_eq!(req.execution_mode, ExecutionMode::DryRun);
        assert!(!req.requires_review);
        assert!(req.operations.is_empty());
        assert!(req.dry_run.is_none());
    }
}
