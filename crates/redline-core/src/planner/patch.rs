//! Patch plan construction.

use crate::diff_verify::{diff_files, render_replacement_diff};
use crate::domain::{ExecutionIntent, PatchFile, PatchPlan, PlannedCommand};

/// Actions that never change tracked file content.
pub(crate) const NON_CONTENT_ACTIONS: &[&str] = &["mkdir", "set_env", "unset_env"];

pub(crate) fn changes_content(command: &PlannedCommand) -> bool {
    !NON_CONTENT_ACTIONS.contains(&command.action.as_str())
}

/// Paths a command touches: its declared path, else the files its diff names.
pub(crate) fn command_paths(command: &PlannedCommand) -> Vec<String> {
    match (&command.path, &command.diff) {
        (Some(path), _) => vec![path.clone()],
        (None, Some(diff)) => diff_files(diff),
        (None, None) => Vec::new(),
    }
}

/// One patch file per content-changing command with a path.
///
/// The diff is the command's own when given, otherwise a new-file diff
/// rendered from `content`. Deletions without a diff carry an empty one.
pub fn build_patch_plan(intent: &ExecutionIntent) -> PatchPlan {
    let files = intent
        .planned_commands
        .iter()
        .filter(|c| changes_content(c))
        .flat_map(|command| {
            command_paths(command)
                .into_iter()
                .map(move |path| PatchFile {
                    diff: command.diff.clone().unwrap_or_else(|| {
                        render_replacement_diff(&path, None, command.content.as_deref())
                    }),
                    evidence_refs: command.evidence_refs.clone(),
                    path,
                })
        })
        .collect();
    PatchPlan { files }
}
