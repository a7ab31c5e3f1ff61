//! Error types for the policy module.

use std::path::PathBuf;

/// Errors produced while loading or enforcing a sandbox policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The document does not conform to the policy schema.
    #[error("policy schema validation failed: {}", errors.join("; "))]
    Schema { errors: Vec<String> },

    #[error("policy denied '{operation}': {reason}")]
    Denied { operation: String, reason: String },

    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to read policy {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PolicyError {
    pub(crate) fn denied(operation: &str, reason: impl Into<String>) -> Self {
        Self::Denied {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            errors: vec![message.into()],
        }
    }
}

/// Result type for policy operations.
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
