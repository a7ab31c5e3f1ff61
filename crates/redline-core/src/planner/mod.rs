//! Deterministic planning: intent in, graph and patch/commit plans out.
//!
//! Planning is a pure transform. It never invents paths, commands or
//! evidence ids; everything in a plan is traceable to a field of the intent.

pub mod commit;
pub mod graph;
pub mod patch;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use commit::{build_commit_plan, default_commit_message};
pub use graph::build_graph;
pub use patch::build_patch_plan;

use crate::domain::{
    CommitPlan, DryExecutionResult, ExecutionGraph, ExecutionIntent, Lineage, PatchPlan,
    ReviewPackStub, RiskSummary, RiskTier,
};

pub const PLANNER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("planned command has an empty command_id")]
    EmptyCommandId,

    #[error("duplicate command id '{command_id}'")]
    DuplicateCommand { command_id: String },

    #[error("command '{command_id}' depends on undeclared command '{dependency}'")]
    UnknownDependency {
        command_id: String,
        dependency: String,
    },

    #[error("failed to encode plan for checksum: {0}")]
    Checksum(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub graph: ExecutionGraph,
    pub patch_plan: PatchPlan,
    pub commit_plan: CommitPlan,
}

pub fn plan(intent: &ExecutionIntent) -> Result<Plan, PlanError> {
    Ok(Plan {
        graph: build_graph(intent)?,
        patch_plan: build_patch_plan(intent),
        commit_plan: build_commit_plan(intent),
    })
}

/// Plan `intent` and wrap the result with review routing, checksum, lineage
/// and metadata. Nothing is executed.
pub fn dry_run(
    intent: &ExecutionIntent,
    declared_outputs: Vec<PathBuf>,
) -> Result<DryExecutionResult, PlanError> {
    let Plan {
        graph,
        patch_plan,
        commit_plan,
    } = plan(intent)?;
    let review_pack_stub = review_stub(intent);
    let checksum = DryExecutionResult::compute_checksum(
        &graph,
        &patch_plan,
        &commit_plan,
        &review_pack_stub,
    )?;

    let mut metadata = BTreeMap::new();
    metadata.insert(
        "planner_version".to_string(),
        Value::String(PLANNER_VERSION.to_string()),
    );
    metadata.insert("mode".to_string(), Value::String("dry_run".to_string()));

    Ok(DryExecutionResult {
        graph,
        patch_plan,
        commit_plan,
        review_pack_stub,
        checksum: Some(checksum),
        lineage: Some(Lineage {
            intent_id: intent.intent_id.clone(),
            evidence_digest: intent.evidence_digest(),
            planner_version: PLANNER_VERSION.to_string(),
        }),
        metadata,
        declared_outputs,
    })
}

fn review_stub(intent: &ExecutionIntent) -> ReviewPackStub {
    let dominant_risk = intent
        .planned_commands
        .iter()
        .filter_map(|c| c.risk)
        .fold(intent.risk.overall, RiskTier::max);

    let mut requires_review: Vec<String> = intent
        .planned_commands
        .iter()
        .filter(|c| c.risk.is_some_and(RiskTier::requires_approval))
        .map(|c| c.command_id.clone())
        .collect();
    if requires_review.is_empty() && intent.risk.overall.requires_approval() {
        requires_review.push(intent.intent_id.clone());
    }

    ReviewPackStub {
        requires_review,
        risk_summary: RiskSummary { dominant_risk },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PlannedCommand;

    fn write(id: &str, path: &str, content: &str) -> PlannedCommand {
        let mut c = PlannedCommand::new(id, "write_file");
        c.path = Some(path.into());
        c.content = Some(content.into());
        c.evidence_refs = vec![path.into()];
        c
    }

    fn intent(commands: Vec<PlannedCommand>) -> ExecutionIntent {
        ExecutionIntent {
            intent_id: "intent-1".into(),
            scope: Default::default(),
            evidence_refs: vec!["ev-1".into()],
            planned_commands: commands,
            risk: Default::default(),
        }
    }

    #[test]
    fn one_node_per_command_with_dependency_edges() {
        let mut b = write("b", "src/b.py", "b\n");
        b.depends_on = vec!["a".into()];
        let plan = plan(&intent(vec![write("a", "src/a.py", "a\n"), b])).unwrap();

        assert_eq!(plan.graph.nodes.len(), 2);
        assert_eq!(plan.graph.nodes[0].node_type, "write_file");
        assert_eq!(plan.graph.nodes[0].attrs["path"], "src/a.py");
        assert_eq!(plan.graph.dependencies_of("b"), vec!["a"]);
    }

    #[test]
    fn duplicate_and_unknown_ids_rejected() {
        let err = plan(&intent(vec![write("a", "x", ""), write("a", "y", "")])).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateCommand { ref command_id } if command_id == "a"));

        let mut b = write("b", "y", "");
        b.depends_on = vec!["ghost".into()];
        let err = plan(&intent(vec![b])).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
    }

    #[test]
    fn patch_plan_renders_content_and_skips_directories() {
        let mut mkdir = PlannedCommand::new("d", "mkdir");
        mkdir.path = Some("src/pkg".into());
        mkdir.evidence_refs = vec!["src/pkg".into()];
        let plan = plan(&intent(vec![mkdir, write("a", "src/a.py", "x = 1\n")])).unwrap();

        assert_eq!(plan.patch_plan.files.len(), 1);
        let file = &plan.patch_plan.files[0];
        assert_eq!(file.path, "src/a.py");
        assert!(file.diff.starts_with("diff --git a/src/a.py b/src/a.py\n"));
        assert!(file.diff.contains("+x = 1\n"));
        assert_eq!(file.evidence_refs, vec!["src/a.py"]);
    }

    #[test]
    fn commit_steps_group_by_message_in_first_appearance_order() {
        let mut a = write("a", "src/a.py", "a\n");
        a.commit_message = Some("first".into());
        let mut b = write("b", "src/b.py", "b\n");
        b.commit_message = Some("second".into());
        let mut c = write("c", "src/c.py", "c\n");
        c.commit_message = Some("first".into());
        let d = write("d", "src/d.py", "d\n");

        let plan = plan(&intent(vec![a, b, c, d])).unwrap();
        let steps = &plan.commit_plan.steps;
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].message, "first");
        assert_eq!(steps[0].file_set, vec!["src/a.py", "src/c.py"]);
        assert_eq!(steps[1].file_set, vec!["src/b.py"]);
        assert_eq!(steps[2].message, "redline: apply intent intent-1");
    }

    #[test]
    fn apply_patch_without_path_uses_diff_headers() {
        let mut p = PlannedCommand::new("p", "apply_patch");
        p.diff = Some(crate::diff_verify::render_replacement_diff(
            "lib/x.rs",
            Some("a\n"),
            Some("b\n"),
        ));
        p.evidence_refs = vec!["lib/x.rs".into()];
        let plan = plan(&intent(vec![p])).unwrap();
        assert_eq!(plan.patch_plan.paths().collect::<Vec<_>>(), vec!["lib/x.rs"]);
        assert_eq!(plan.commit_plan.steps[0].file_set, vec!["lib/x.rs"]);
    }

    #[test]
    fn dry_run_is_deterministic_and_carries_lineage() {
        let i = intent(vec![write("a", "src/a.py", "a\n")]);
        let first = dry_run(&i, vec![]).unwrap();
        let second = dry_run(&i, vec![]).unwrap();
        assert_eq!(first.checksum, second.checksum);
        assert!(first.checksum_matches());

        let lineage = first.lineage.as_ref().unwrap();
        assert_eq!(lineage.intent_id, "intent-1");
        assert_eq!(lineage.evidence_digest, i.evidence_digest());
        assert_eq!(first.metadata["mode"], "dry_run");
        assert_eq!(first.metadata["planner_version"], PLANNER_VERSION);
    }

    #[test]
    fn review_stub_tracks_high_risk_commands() {
        let mut a = write("a", "src/a.py", "a\n");
        a.risk = Some(RiskTier::High);
        let b = write("b", "src/b.py", "b\n");
        let dry = dry_run(&intent(vec![a, b]), vec![]).unwrap();
        assert_eq!(dry.review_pack_stub.requires_review, vec!["a"]);
        assert_eq!(dry.review_pack_stub.risk_summary.dominant_risk, RiskTier::High);
    }

    #[test]
    fn intent_level_risk_routes_intent_to_review() {
        let mut i = intent(vec![write("a", "src/a.py", "a\n")]);
        i.risk.overall = RiskTier::Critical;
        let dry = dry_run(&i, vec![]).unwrap();
        assert_eq!(dry.review_pack_stub.requires_review, vec!["intent-1"]);
        assert_eq!(
            dry.review_pack_stub.risk_summary.dominant_risk,
            RiskTier::Critical
        );
    }
}
