//! Isolated git worktree with a hard path-containment boundary.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use super::error::{SandboxError, SandboxResult};
use crate::git::{self, CommitIdentity};
use crate::policy::normalize_relative;

/// Real-path containment check against a canonical worktree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeBoundary {
    root: PathBuf,
}

impl WorktreeBoundary {
    /// `root` must already exist; it is canonicalized here.
    pub fn new(root: impl AsRef<Path>) -> SandboxResult<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True only when `path` resolves (through symlinks and `..`) to a
    /// location inside the root, outside its `.git` entry.
    ///
    /// Relative paths are taken relative to the root. For paths that do not
    /// exist yet, the deepest existing ancestor is canonicalized and the
    /// missing tail, which cannot contain symlinks, is applied lexically.
    pub fn contains(&self, path: &Path) -> bool {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let Some(real) = resolve_existing_prefix(&candidate) else {
            return false;
        };
        match real.strip_prefix(&self.root) {
            Ok(rel) => rel.components().next() != Some(Component::Normal(OsStr::new(".git"))),
            Err(_) => false,
        }
    }

    /// Map a repository-relative path to its location inside the root.
    pub fn resolve(&self, relative: &str) -> SandboxResult<(String, PathBuf)> {
        let normalized = normalize_relative(relative).map_err(|_| SandboxError::PathEscape {
            path: relative.to_string(),
        })?;
        let absolute = self.root.join(&normalized);
        if !self.contains(&absolute) {
            return Err(SandboxError::PathEscape {
                path: relative.to_string(),
            });
        }
        Ok((normalized, absolute))
    }
}

fn resolve_existing_prefix(candidate: &Path) -> Option<PathBuf> {
    let existing = candidate
        .ancestors()
        .find(|a| !a.as_os_str().is_empty() && a.symlink_metadata().is_ok())?;
    let real = existing.canonicalize().ok()?;
    let tail = candidate.strip_prefix(existing).ok()?;
    let mut resolved = real;
    for component in tail.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

/// A disposable worktree of the target repository at a fixed base commit.
///
/// The worktree lives outside the target repository. Dropping a created
/// sandbox removes the worktree on a best-effort basis.
#[derive(Debug)]
pub struct Sandbox {
    repo: PathBuf,
    base_commit: String,
    identity: CommitIdentity,
    boundary: Option<WorktreeBoundary>,
}

impl Sandbox {
    /// Bind to `repo` and resolve `base_commit` to a full SHA.
    pub fn new(repo: impl AsRef<Path>, base_commit: &str) -> SandboxResult<Self> {
        let repo = repo.as_ref();
        if !git::is_git_repo(repo) {
            return Err(SandboxError::NotARepository(repo.to_path_buf()));
        }
        let repo = repo.canonicalize()?;
        let base_commit = git::resolve_commit(&repo, base_commit)?;
        Ok(Self {
            repo,
            base_commit,
            identity: CommitIdentity::default(),
            boundary: None,
        })
    }

    pub fn with_identity(mut self, identity: CommitIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Full SHA of the base commit.
    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    pub fn root(&self) -> Option<&Path> {
        self.boundary.as_ref().map(WorktreeBoundary::root)
    }

    pub fn boundary(&self) -> Option<&WorktreeBoundary> {
        self.boundary.as_ref()
    }

    /// Fail unless the target repository's HEAD is still the base commit.
    pub fn ensure_target_at_base(&self) -> SandboxResult<()> {
        let head = git::capture_head_sha(&self.repo)?;
        if head != self.base_commit {
            return Err(SandboxError::BaseMismatch {
                expected: self.base_commit.clone(),
                actual: head,
            });
        }
        Ok(())
    }

    /// Create the worktree under `parent`, which must lie outside the repo.
    pub fn create(&mut self, parent: &Path) -> SandboxResult<&Path> {
        if let Some(existing) = &self.boundary {
            return Err(SandboxError::AlreadyCreated(existing.root().to_path_buf()));
        }
        std::fs::create_dir_all(parent)?;
        let parent = parent.canonicalize()?;
        if parent.starts_with(&self.repo) {
            return Err(SandboxError::ParentInsideRepo { parent });
        }
        let path = parent.join(format!("redline-wt-{}", uuid::Uuid::new_v4().simple()));
        git::worktree_add(&self.repo, &path, &self.base_commit)?;
        debug!(worktree = %path.display(), base = %self.base_commit, "sandbox worktree created");
        let boundary = self.boundary.insert(WorktreeBoundary::new(&path)?);
        Ok(boundary.root())
    }

    /// False for every path until [`Sandbox::create`] has succeeded.
    pub fn is_path_in_worktree(&self, path: &Path) -> bool {
        self.boundary.as_ref().is_some_and(|b| b.contains(path))
    }

    pub fn resolve(&self, relative: &str) -> SandboxResult<PathBuf> {
        let boundary = self.boundary.as_ref().ok_or(SandboxError::NotCreated)?;
        boundary.resolve(relative).map(|(_, abs)| abs)
    }

    fn require_root(&self) -> SandboxResult<&Path> {
        self.root().ok_or(SandboxError::NotCreated)
    }

    pub fn head_sha(&self) -> SandboxResult<String> {
        Ok(git::capture_head_sha(self.require_root()?)?)
    }

    /// Commit `file_set` (everything when empty) inside the worktree.
    pub fn commit(&self, message: &str, file_set: &[String]) -> SandboxResult<String> {
        Ok(git::commit(
            self.require_root()?,
            message,
            file_set,
            &self.identity,
        )?)
    }

    /// Commits made in the worktree since the base, oldest first.
    pub fn commits(&self) -> SandboxResult<Vec<String>> {
        Ok(git::rev_list(
            self.require_root()?,
            &format!("{}..HEAD", self.base_commit),
        )?)
    }

    /// Export every worktree commit as a mail patch into `out_dir`.
    pub fn format_patch(&self, out_dir: &Path) -> SandboxResult<Vec<PathBuf>> {
        std::fs::create_dir_all(out_dir)?;
        Ok(git::format_patch(
            self.require_root()?,
            &self.base_commit,
            out_dir,
        )?)
    }

    /// Remove the worktree. Idempotent.
    pub fn remove(&mut self) -> SandboxResult<()> {
        if let Some(boundary) = self.boundary.take() {
            git::worktree_remove(&self.repo, boundary.root())?;
            debug!(worktree = %boundary.root().display(), "sandbox worktree removed");
        }
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(error = %e, "failed to remove sandbox worktree");
        }
    }
}
