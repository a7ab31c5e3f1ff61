//! Self-proving commit records.
//!
//! The recorder links the commits made in the sandbox, the patch files
//! exported from them and the commits that landed in the target repository.
//! A finished [`SandboxProof`] holds only facts that can be re-checked from
//! disk: commit counts line up and every recorded patch hash is the hash of
//! the file as it exists now.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::sha256_file;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProof {
    pub base_commit: String,
    pub worktree_head_sha: String,
    pub worktree_commits: Vec<String>,
    pub main_repo_commits_after_am: Vec<String>,
    /// Patch file name → SHA-256 of its bytes.
    pub patch_sha256: BTreeMap<String, String>,
    pub patch_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error(
        "proof count mismatch: expected {expected}, worktree commits {worktree}, \
         landed commits {landed}, patches {patches}"
    )]
    CountMismatch {
        expected: usize,
        worktree: usize,
        landed: usize,
        patches: usize,
    },

    #[error("patch {file} hash mismatch: recorded {recorded}, on disk {actual}")]
    HashMismatch {
        file: String,
        recorded: String,
        actual: String,
    },

    #[error("patch {file} unreadable: {source}")]
    PatchUnreadable {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worktree head {head} is not the last worktree commit")]
    HeadMismatch { head: String },

    #[error("invalid patch path: {0}")]
    InvalidPatchPath(PathBuf),
}

pub type ProofResult<T> = std::result::Result<T, ProofError>;

#[derive(Debug)]
pub struct SelfProvingCommitRecorder {
    base_commit: String,
    expected_count: usize,
    worktree_commits: Vec<String>,
    landed_commits: Vec<String>,
    patches: Vec<(String, PathBuf, String)>,
}

impl SelfProvingCommitRecorder {
    /// `expected_count` is the number of commit steps the plan declared.
    pub fn new(base_commit: impl Into<String>, expected_count: usize) -> Self {
        Self {
            base_commit: base_commit.into(),
            expected_count,
            worktree_commits: Vec::new(),
            landed_commits: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn record_worktree_commit(&mut self, sha: impl Into<String>) {
        self.worktree_commits.push(sha.into());
    }

    /// Hash the patch file as it is on disk now. Returns the hash.
    pub fn record_patch(&mut self, path: &Path) -> ProofResult<String> {
        let name = patch_name(path)?;
        let hash = sha256_file(path).map_err(|source| ProofError::PatchUnreadable {
            file: name.clone(),
            source,
        })?;
        self.patches.push((name, path.to_path_buf(), hash.clone()));
        Ok(hash)
    }

    pub fn record_landed_commits<I, S>(&mut self, shas: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.landed_commits.extend(shas.into_iter().map(Into::into));
    }

    /// Check the counts, re-hash every patch and produce the proof.
    pub fn finalize(self, worktree_head_sha: impl Into<String>) -> ProofResult<SandboxProof> {
        let worktree_head_sha = worktree_head_sha.into();
        let counts = [
            self.worktree_commits.len(),
            self.landed_commits.len(),
            self.patches.len(),
        ];
        if counts.iter().any(|&c| c != self.expected_count) {
            return Err(ProofError::CountMismatch {
                expected: self.expected_count,
                worktree: counts[0],
                landed: counts[1],
                patches: counts[2],
            });
        }
        if let Some(last) = self.worktree_commits.last() {
            if *last != worktree_head_sha {
                return Err(ProofError::HeadMismatch {
                    head: worktree_head_sha,
                });
            }
        }

        let mut patch_sha256 = BTreeMap::new();
        for (name, path, recorded) in self.patches {
            let actual = sha256_file(&path).map_err(|source| ProofError::PatchUnreadable {
                file: name.clone(),
                source,
            })?;
            if actual != recorded {
                return Err(ProofError::HashMismatch {
                    file: name,
                    recorded,
                    actual,
                });
            }
            patch_sha256.insert(name, recorded);
        }

        Ok(SandboxProof {
            base_commit: self.base_commit,
            worktree_head_sha,
            worktree_commits: self.worktree_commits,
            main_repo_commits_after_am: self.landed_commits,
            patch_count: patch_sha256.len(),
            patch_sha256,
        })
    }
}

fn patch_name(path: &Path) -> ProofResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .ok_or_else(|| ProofError::InvalidPatchPath(path.to_path_buf()))
}

/// Independently re-check a persisted proof against the patches on disk.
pub fn verify_proof(proof: &SandboxProof, patches_dir: &Path) -> ProofResult<()> {
    let expected = proof.patch_count;
    if proof.worktree_commits.len() != expected
        || proof.main_repo_commits_after_am.len() != expected
        || proof.patch_sha256.len() != expected
    {
        return Err(ProofError::CountMismatch {
            expected,
            worktree: proof.worktree_commits.len(),
            landed: proof.main_repo_commits_after_am.len(),
            patches: proof.patch_sha256.len(),
        });
    }
    for (name, recorded) in &proof.patch_sha256 {
        let actual = sha256_file(&patches_dir.join(name)).map_err(|source| {
            ProofError::PatchUnreadable {
                file: name.clone(),
                source,
            }
        })?;
        if actual != *recorded {
            return Err(ProofError::HashMismatch {
                file: name.clone(),
                recorded: recorded.clone(),
                actual,
            });
        }
    }
    Ok(())
}
