//! Typed form of the sandbox policy document.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    pub policy_id: String,
    pub schema_version: String,
    pub allowlist: AllowlistSection,
    #[serde(default)]
    pub allowed_git_operations: Vec<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub diff_verification: DiffVerificationSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowlistSection {
    pub file_operations: Vec<String>,
    pub paths: Vec<String>,
}

/// Resource limits. An unset limit is unbounded within the run deadline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiffVerificationSection {
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    /// Escalate "path not covered by the allowlist" from warning to error.
    #[serde(default)]
    pub strict_allowed_paths: bool,
}
