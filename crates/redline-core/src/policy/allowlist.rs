//! Default-deny operation allowlist.
//!
//! Operation names are compared byte-for-byte. There is no alias table and
//! no case folding, so an operation can never be admitted by renaming it.

use std::collections::BTreeSet;

use serde_json::Value;

use super::error::{PolicyError, PolicyResult};
use super::paths::{normalize_relative, PathMatcher};

/// Environment variables no policy can allow an operation to set or unset.
pub const PROTECTED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
];

/// Operations that modify the sandbox environment overlay.
pub const ENV_OPERATIONS: &[&str] = &["set_env", "unset_env"];

/// Git-type operations are recognised by this prefix.
pub const GIT_OPERATION_PREFIX: &str = "git_";

pub fn is_git_operation(operation: &str) -> bool {
    operation.starts_with(GIT_OPERATION_PREFIX)
}

pub fn is_protected_env_var(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    PROTECTED_ENV_VARS.iter().any(|p| *p == upper)
}

#[derive(Debug, Clone)]
pub struct AllowlistPolicy {
    file_operations: BTreeSet<String>,
    git_operations: BTreeSet<String>,
    paths: PathMatcher,
}

impl AllowlistPolicy {
    pub fn new<F, G, P>(file_operations: F, git_operations: G, paths: P) -> PolicyResult<Self>
    where
        F: IntoIterator,
        F::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Ok(Self {
            file_operations: file_operations.into_iter().map(Into::into).collect(),
            git_operations: git_operations.into_iter().map(Into::into).collect(),
            paths: PathMatcher::new(paths)?,
        })
    }

    /// Name-only check. Git-type names consult only the git allowlist.
    pub fn is_operation_allowed(&self, operation: &str) -> bool {
        if is_git_operation(operation) {
            self.git_operations.contains(operation)
        } else {
            self.file_operations.contains(operation)
        }
    }

    pub fn path_patterns(&self) -> &[String] {
        self.paths.patterns()
    }

    /// Check one operation and its params against the allowlist.
    ///
    /// Protected environment variables are denied before the allowlist is
    /// consulted. A `path` param, when present, must be a relative path
    /// covered by the path patterns.
    pub fn assert_operation_allowed(&self, operation: &str, params: &Value) -> PolicyResult<()> {
        if ENV_OPERATIONS.contains(&operation) {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| PolicyError::denied(operation, "environment variable name missing"))?;
            if is_protected_env_var(name) {
                return Err(PolicyError::denied(
                    operation,
                    format!("environment variable {name} is protected"),
                ));
            }
        }

        if !self.is_operation_allowed(operation) {
            return Err(PolicyError::denied(operation, "operation not allowlisted"));
        }

        if let Some(raw) = params.get("path") {
            let path = raw
                .as_str()
                .ok_or_else(|| PolicyError::denied(operation, "path param is not a string"))?;
            let normalized = normalize_relative(path)
                .map_err(|reason| PolicyError::denied(operation, format!("invalid path: {reason}")))?;
            if !self.paths.matches(&normalized) {
                return Err(PolicyError::denied(operation, "path not allowed"));
            }
        }

        Ok(())
    }
}
