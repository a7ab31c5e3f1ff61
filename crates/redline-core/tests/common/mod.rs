//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use redline_core::{
    planner, EngineConfig, ExecutionIntent, ExecutionMode, ExecutionRequest, RepoTarget,
    SandboxPolicy,
};
use serde_json::json;
use tempfile::TempDir;

pub fn run_git(repo_dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Temp repo with one commit containing `README.md`.
pub fn make_git_repo() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    run_git(dir.path(), &["init", "-q"]);
    run_git(dir.path(), &["config", "user.name", "test-user"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
    run_git(dir.path(), &["add", "README.md"]);
    run_git(dir.path(), &["commit", "-q", "-m", "initial"]);
    dir
}

pub fn head_sha(repo: &Path) -> String {
    run_git(repo, &["rev-parse", "HEAD"])
}

/// Intent writing `src/a.py` and `src/b.py` in one commit, the second
/// depending on the first.
pub fn two_file_intent() -> ExecutionIntent {
    ExecutionIntent::from_json(
        &json!({
            "intent_id": "intent-e2e",
            "scope": {"targets": {"files": ["src/a.py", "src/b.py"]}},
            "evidence_refs": ["issue-42"],
            "planned_commands": [
                {
                    "command_id": "write-a",
                    "action": "write_file",
                    "path": "src/a.py",
                    "content": "def a():\n    return 1\n",
                    "commit_message": "add a and b",
                    "evidence_refs": ["src/a.py"]
                },
                {
                    "command_id": "write-b",
                    "action": "write_file",
                    "path": "src/b.py",
                    "content": "from a import a\n",
                    "commit_message": "add a and b",
                    "evidence_refs": ["src/b.py"],
                    "depends_on": ["write-a"]
                }
            ]
        })
        .to_string(),
    )
    .unwrap()
}

/// Policy allowing file writes under `src/` plus the git actions commit
/// application needs.
pub fn src_policy() -> SandboxPolicy {
    SandboxPolicy::from_value(json!({
        "policy_id": "policy-src",
        "schema_version": "1.0",
        "allowlist": {
            "file_operations": ["write_file", "delete_file", "mkdir"],
            "paths": ["src/**"]
        },
        "allowed_git_operations": ["git_commit", "git_format_patch", "git_am"],
        "limits": {"max_files": 10, "timeout_seconds": 60},
        "diff_verification": {"forbidden_paths": [".git/**"]}
    }))
    .unwrap()
}

pub fn request_for(
    intent: &ExecutionIntent,
    repo: &Path,
    request_id: &str,
    mode: ExecutionMode,
) -> ExecutionRequest {
    let dry_run = planner::dry_run(intent, Vec::new()).unwrap();
    ExecutionRequest::from_dry_run(
        request_id,
        RepoTarget {
            repo_id: "repo_x".into(),
            path: repo.to_path_buf(),
            base_commit: "HEAD".into(),
        },
        mode,
        dry_run,
        Some(intent.clone()),
    )
}

/// Engine config rooted entirely inside `state`.
pub fn config_in(state: &Path) -> EngineConfig {
    EngineConfig {
        output_root: state.join("runs"),
        lock_dir: state.join("locks"),
        review_dir: state.join("review"),
        worktree_root: None,
        max_concurrency: 2,
        lock_ttl_secs: 600,
        ..EngineConfig::default()
    }
}
