//! Execution graph construction.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use super::PlanError;
use crate::domain::{ExecutionGraph, ExecutionIntent, GraphEdge, GraphNode, PlannedCommand};

/// One node per planned command, one edge per declared dependency.
pub fn build_graph(intent: &ExecutionIntent) -> Result<ExecutionGraph, PlanError> {
    let mut seen = HashSet::new();
    for command in &intent.planned_commands {
        if command.command_id.trim().is_empty() {
            return Err(PlanError::EmptyCommandId);
        }
        if !seen.insert(command.command_id.as_str()) {
            return Err(PlanError::DuplicateCommand {
                command_id: command.command_id.clone(),
            });
        }
    }

    let mut graph = ExecutionGraph::default();
    for command in &intent.planned_commands {
        for dep in &command.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    command_id: command.command_id.clone(),
                    dependency: dep.clone(),
                });
            }
            graph.edges.push(GraphEdge {
                from: dep.clone(),
                to: command.command_id.clone(),
            });
        }
        graph.nodes.push(GraphNode {
            node_id: command.command_id.clone(),
            node_type: command.action.clone(),
            evidence_refs: command.evidence_refs.clone(),
            attrs: node_attrs(command),
        });
    }
    Ok(graph)
}

fn node_attrs(command: &PlannedCommand) -> BTreeMap<String, Value> {
    let mut attrs = command.params.clone();
    if let Some(path) = &command.path {
        attrs.insert("path".into(), Value::String(path.clone()));
    }
    if let Some(content) = &command.content {
        attrs.insert("content".into(), Value::String(content.clone()));
    }
    if let Some(diff) = &command.diff {
        attrs.insert("diff".into(), Value::String(diff.clone()));
    }
    attrs
}
