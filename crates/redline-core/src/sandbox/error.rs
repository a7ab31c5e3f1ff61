//! Error types for the sandbox module.

use std::path::PathBuf;

use crate::git::GitError;

/// Errors produced by the sandbox layer.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox worktree has not been created")]
    NotCreated,

    #[error("sandbox worktree already exists at {0}")]
    AlreadyCreated(PathBuf),

    #[error("{0} is not a git repository")]
    NotARepository(PathBuf),

    #[error("worktree parent {parent} lies inside the target repository")]
    ParentInsideRepo { parent: PathBuf },

    #[error("path escapes the sandbox: {path}")]
    PathEscape { path: String },

    #[error("target repository HEAD {actual} does not match base commit {expected}")]
    BaseMismatch { expected: String, actual: String },

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
