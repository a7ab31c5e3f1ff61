//! Sandbox policy: schema-validated loading and default-deny enforcement.
//!
//! Untrusted policy JSON is checked against the embedded JSON schema and then
//! parsed into [`PolicyDocument`] exactly once, at [`SandboxPolicy::load`].
//! Everything downstream works with the compiled, immutable [`SandboxPolicy`].

pub mod allowlist;
pub mod document;
pub mod error;
pub mod paths;

use std::path::Path;
use std::time::Duration;

use serde_json::Value;

pub use allowlist::{is_git_operation, is_protected_env_var, AllowlistPolicy, PROTECTED_ENV_VARS};
pub use document::{AllowlistSection, DiffVerificationSection, PolicyDocument, ResourceLimits};
pub use error::{PolicyError, PolicyResult};
pub use paths::{normalize_relative, PathMatcher};

use crate::diff_verify::DiffVerifier;

/// JSON schema every policy document must satisfy.
pub const POLICY_SCHEMA: &str = include_str!("../../schemas/sandbox_policy.schema.json");

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    document: PolicyDocument,
    allowlist: AllowlistPolicy,
}

impl SandboxPolicy {
    /// Read, schema-validate and compile a policy file.
    pub fn load(path: impl AsRef<Path>) -> PolicyResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> PolicyResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| PolicyError::schema(format!("policy is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> PolicyResult<Self> {
        validate_against_schema(&value)?;
        let document: PolicyDocument = serde_json::from_value(value)
            .map_err(|e| PolicyError::schema(format!("policy does not match model: {e}")))?;
        Self::from_document(document)
    }

    /// Compile an already-typed document. Patterns are still validated.
    pub fn from_document(document: PolicyDocument) -> PolicyResult<Self> {
        let allowlist = AllowlistPolicy::new(
            document.allowlist.file_operations.iter().cloned(),
            document.allowed_git_operations.iter().cloned(),
            document.allowlist.paths.iter().cloned(),
        )?;
        PathMatcher::new(document.diff_verification.forbidden_paths.iter().cloned())?;
        Ok(Self {
            document,
            allowlist,
        })
    }

    pub fn policy_id(&self) -> &str {
        &self.document.policy_id
    }

    pub fn schema_version(&self) -> &str {
        &self.document.schema_version
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.document
    }

    pub fn allowlist(&self) -> &AllowlistPolicy {
        &self.allowlist
    }

    pub fn assert_operation_allowed(&self, operation: &str, params: &Value) -> PolicyResult<()> {
        self.allowlist.assert_operation_allowed(operation, params)
    }

    /// Maximum size of a single written file, in bytes.
    pub fn max_file_size(&self) -> Option<u64> {
        self.document
            .limits
            .max_file_size_mb
            .map(|mb| (mb * BYTES_PER_MB) as u64)
    }

    pub fn max_files(&self) -> Option<usize> {
        self.document.limits.max_files
    }

    /// Global deadline for one run.
    pub fn timeout(&self) -> Option<Duration> {
        self.document.limits.timeout_seconds.map(Duration::from_secs)
    }

    /// Diff verifier configured from the allowlist paths and the
    /// diff-verification section.
    pub fn diff_verifier(&self) -> PolicyResult<DiffVerifier> {
        Ok(DiffVerifier::new(
            PathMatcher::new(self.document.allowlist.paths.iter().cloned())?,
            PathMatcher::new(self.document.diff_verification.forbidden_paths.iter().cloned())?,
        )
        .strict(self.document.diff_verification.strict_allowed_paths))
    }
}

fn validate_against_schema(value: &Value) -> PolicyResult<()> {
    let schema: Value = serde_json::from_str(POLICY_SCHEMA)
        .map_err(|e| PolicyError::schema(format!("embedded schema is invalid: {e}")))?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| PolicyError::schema(format!("embedded schema is invalid: {e}")))?;
    if validator.is_valid(value) {
        return Ok(());
    }
    let errors = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    Err(PolicyError::Schema { errors })
}
