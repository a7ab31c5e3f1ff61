//! Sandboxed execution: isolated worktree plus the runners acting on it.

pub mod error;
pub mod runner;
pub mod worktree;

pub use error::{SandboxError, SandboxResult};
pub use runner::{SandboxOperationRunner, VerifyingRunner, SUPPORTED_ACTIONS};
pub use worktree::{Sandbox, WorktreeBoundary};
