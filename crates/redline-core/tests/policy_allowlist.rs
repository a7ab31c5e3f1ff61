//! Default-deny and exact-match properties of the sandbox policy.

use redline_core::{PolicyError, SandboxPolicy};
use serde_json::{json, Value};

fn policy() -> SandboxPolicy {
    SandboxPolicy::from_json_str(
        r#"{
            "policy_id": "allowlist-e2e",
            "schema_version": "1.2",
            "allowlist": {
                "file_operations": ["write_file", "set_env"],
                "paths": ["src/**", "README.md"]
            },
            "allowed_git_operations": ["git_commit"]
        }"#,
    )
    .unwrap()
}

fn is_denied(result: Result<(), PolicyError>) -> bool {
    matches!(result, Err(PolicyError::Denied { .. }))
}

// -------------------------------------------------------------------------
// Default deny
// -------------------------------------------------------------------------

#[test]
fn test_operations_outside_both_lists_are_denied() {
    let policy = policy();
    for op in [
        "delete_file",
        "apply_patch",
        "mkdir",
        "exec",
        "shell",
        "git_push",
        "git_am",
        "",
        "unset_env",
    ] {
        assert!(
            is_denied(policy.assert_operation_allowed(op, &Value::Null)),
            "{op:?} should be denied"
        );
    }
}

#[test]
fn test_git_operations_only_consult_the_git_list() {
    let policy = SandboxPolicy::from_value(json!({
        "policy_id": "git-in-file-list",
        "schema_version": "1.0",
        "allowlist": {"file_operations": ["git_push"], "paths": []}
    }))
    .unwrap();
    assert!(is_denied(
        policy.assert_operation_allowed("git_push", &Value::Null)
    ));
}

// -------------------------------------------------------------------------
// No bypass by rename
// -------------------------------------------------------------------------

#[test]
fn test_single_character_variants_are_denied() {
    let policy = policy();
    let params = json!({"path": "src/a.py"});
    assert!(policy.assert_operation_allowed("write_file", &params).is_ok());

    let base = "write_file";
    let mut variants = vec![
        "Write_file".to_string(),
        "WRITE_FILE".to_string(),
        "write-file".to_string(),
        "write_file ".to_string(),
        " write_file".to_string(),
        "write_files".to_string(),
        "writefile".to_string(),
    ];
    for i in 0..base.len() {
        let mut dropped = base.to_string();
        dropped.remove(i);
        variants.push(dropped);
    }
    for variant in variants {
        assert!(
            is_denied(policy.assert_operation_allowed(&variant, &params)),
            "{variant:?} must not match write_file"
        );
    }
}

#[test]
fn test_git_variants_are_denied() {
    let policy = policy();
    assert!(policy
        .assert_operation_allowed("git_commit", &Value::Null)
        .is_ok());
    for variant in ["git_Commit", "git_commit_", "git-commit", "gitcommit"] {
        assert!(is_denied(
            policy.assert_operation_allowed(variant, &Value::Null)
        ));
    }
}

// -------------------------------------------------------------------------
// Paths and protected variables
// -------------------------------------------------------------------------

#[test]
fn test_paths_must_match_and_stay_relative() {
    let policy = policy();
    for ok in ["src/a.py", "src/deep/nested/b.rs", "README.md"] {
        assert!(
            policy
                .assert_operation_allowed("write_file", &json!({ "path": ok }))
                .is_ok(),
            "{ok} should be allowed"
        );
    }
    for bad in ["docs/a.md", "/etc/passwd", "src/../secrets", "../src/a.py"] {
        assert!(
            is_denied(policy.assert_operation_allowed("write_file", &json!({ "path": bad }))),
            "{bad} should be denied"
        );
    }
}

#[test]
fn test_protected_env_vars_cannot_be_allowlisted() {
    let policy = policy();
    assert!(policy
        .assert_operation_allowed("set_env", &json!({"name": "RUST_LOG", "value": "debug"}))
        .is_ok());
    for name in ["PATH", "HOME", "LD_PRELOAD", "GIT_DIR", "path"] {
        assert!(
            is_denied(
                policy.assert_operation_allowed("set_env", &json!({"name": name, "value": "x"}))
            ),
            "{name} must stay protected"
        );
    }
}

// -------------------------------------------------------------------------
// Schema boundary
// -------------------------------------------------------------------------

#[test]
fn test_schema_errors_are_all_reported() {
    let err = SandboxPolicy::from_json_str(
        r#"{
            "policy_id": "",
            "schema_version": "2.0",
            "allowlist": {"file_operations": "write_file", "paths": []},
            "surprise": true
        }"#,
    )
    .unwrap_err();
    match err {
        PolicyError::Schema { errors } => assert!(errors.len() >= 3, "{errors:?}"),
        other => panic!("expected schema error, got {other:?}"),
    }
}

#[test]
fn test_load_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    std::fs::write(
        &path,
        r#"{"policy_id": "disk", "schema_version": "1.0",
            "allowlist": {"file_operations": ["write_file"], "paths": ["src/**"]},
            "limits": {"max_file_size_mb": 1, "max_files": 3, "timeout_seconds": 5}}"#,
    )
    .unwrap();
    let policy = SandboxPolicy::load(&path).unwrap();
    assert_eq!(policy.policy_id(), "disk");
    assert_eq!(policy.max_file_size(), Some(1024 * 1024));
    assert_eq!(policy.max_files(), Some(3));
    assert_eq!(policy.timeout(), Some(std::time::Duration::from_secs(5)));

    let missing = SandboxPolicy::load(dir.path().join("nope.json")).unwrap_err();
    assert!(matches!(missing, PolicyError::Read { .. }));
}
