//! Commit plan construction.

use super::patch::{changes_content, command_paths};
use crate::domain::{CommitPlan, CommitStep, ExecutionIntent};

pub fn default_commit_message(intent: &ExecutionIntent) -> String {
    format!("redline: apply intent {}", intent.intent_id)
}

/// Group content-changing commands by commit message, in order of first
/// appearance. Each step stages exactly the paths of its commands.
pub fn build_commit_plan(intent: &ExecutionIntent) -> CommitPlan {
    let default_message = default_commit_message(intent);
    let mut steps: Vec<CommitStep> = Vec::new();

    for command in intent.planned_commands.iter().filter(|c| changes_content(c)) {
        let paths = command_paths(command);
        if paths.is_empty() {
            continue;
        }
        let message = command
            .commit_message
            .clone()
            .unwrap_or_else(|| default_message.clone());
        let idx = match steps.iter().position(|s| s.message == message) {
            Some(idx) => idx,
            None => {
                steps.push(CommitStep {
                    message,
                    file_set: Vec::new(),
                });
                steps.len() - 1
            }
        };
        for path in paths {
            if !steps[idx].file_set.contains(&path) {
                steps[idx].file_set.push(path);
            }
        }
    }
    CommitPlan { steps }
}
