//! Plan artifacts: execution graph, patch plan, commit plan and the dry-run
//! result that bundles them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::risk::RiskTier;

/// A node of the execution graph, one per planned command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub node_id: String,
    /// The command's action name.
    pub node_type: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

/// `from` must reach a terminal success before `to` may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl ExecutionGraph {
    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Ids of the nodes `node_id` depends on, in edge order.
    pub fn dependencies_of(&self, node_id: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.to == node_id)
            .map(|e| e.from.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFile {
    pub path: String,
    pub diff: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPlan {
    #[serde(default)]
    pub files: Vec<PatchFile>,
}

impl PatchPlan {
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.path.as_str())
    }
}

/// One commit to create in the sandbox, staging exactly `file_set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStep {
    pub message: String,
    #[serde(default)]
    pub file_set: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPlan {
    #[serde(default)]
    pub steps: Vec<CommitStep>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub dominant_risk: RiskTier,
}

/// Review routing prepared at plan time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPackStub {
    /// Node (or intent) ids a reviewer must look at.
    #[serde(default)]
    pub requires_review: Vec<String>,
    #[serde(default)]
    pub risk_summary: RiskSummary,
}

/// Where a dry run came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    pub intent_id: String,
    /// SHA-256 of the intent's evidence snapshot.
    pub evidence_digest: String,
    pub planner_version: String,
}

/// Output of a dry run, validated by the red-line validator before any apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DryExecutionResult {
    pub graph: ExecutionGraph,
    pub patch_plan: PatchPlan,
    pub commit_plan: CommitPlan,
    #[serde(default)]
    pub review_pack_stub: ReviewPackStub,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub lineage: Option<Lineage>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Files the dry run declares it will write.
    #[serde(default)]
    pub declared_outputs: Vec<PathBuf>,
}

impl DryExecutionResult {
    /// Hex SHA-256 over the canonical JSON of the three plans and the review
    /// stub.
    ///
    /// Objects are re-encoded through `serde_json::Value`, whose maps are
    /// key-ordered, so the digest is independent of struct field order.
    pub fn compute_checksum(
        graph: &ExecutionGraph,
        patch_plan: &PatchPlan,
        commit_plan: &CommitPlan,
        review_pack_stub: &ReviewPackStub,
    ) -> serde_json::Result<String> {
        let canonical = serde_json::json!({
            "graph": serde_json::to_value(graph)?,
            "patch_plan": serde_json::to_value(patch_plan)?,
            "commit_plan": serde_json::to_value(commit_plan)?,
            "review_pack_stub": serde_json::to_value(review_pack_stub)?,
        });
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// True when a checksum is present and matches the current plans and
    /// review stub.
    pub fn checksum_matches(&self) -> bool {
        match (
            &self.checksum,
            Self::compute_checksum(
                &self.graph,
                &self.patch_plan,
                &self.commit_plan,
                &self.review_pack_stub,
            ),
        ) {
            (Some(recorded), Ok(actual)) => *recorded == actual,
            _ => false,
        }
    }
}
