//! Git plumbing used by the sandbox and the commit recorder.
//!
//! Every call shells out to the `git` binary with an explicit working
//! directory. Commits and `am` pass the engine identity through `-c` flags so
//! no global git configuration is required.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Author and committer identity for engine-created commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "redline".to_string(),
            email: "redline@localhost".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },

    #[error("git {args} returned empty output")]
    EmptyOutput { args: String },

    #[error("nothing to commit for '{message}'")]
    NothingToCommit { message: String },

    #[error("git am failed ({apply}) and am --abort also failed ({abort}); repository left mid-apply")]
    AmAbortFailed { apply: String, abort: String },
}

pub type GitResult<T> = std::result::Result<T, GitError>;

/// Environment changes applied to a git child process. `None` unsets.
pub type EnvOverlay = BTreeMap<String, Option<String>>;

fn git_command(dir: &Path, env: Option<&EnvOverlay>) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(dir).env("GIT_TERMINAL_PROMPT", "0");
    if let Some(env) = env {
        for (key, value) in env {
            match value {
                Some(v) => cmd.env(key, v),
                None => cmd.env_remove(key),
            };
        }
    }
    cmd
}

fn run<I, S>(dir: &Path, args: I, env: Option<&EnvOverlay>) -> GitResult<std::process::Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let output = git_command(dir, env).args(&args).output()?;
    if !output.status.success() {
        return Err(GitError::Failed {
            args: render_args(&args),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

fn run_stdout<I, S>(dir: &Path, args: I) -> GitResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run(dir, args, None)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn render_args(args: &[std::ffi::OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn identity_args(identity: &CommitIdentity) -> Vec<String> {
    vec![
        "-c".into(),
        format!("user.name={}", identity.name),
        "-c".into(),
        format!("user.email={}", identity.email),
        "-c".into(),
        "commit.gpgsign=false".into(),
    ]
}

/// Capture the HEAD commit SHA from a git repository.
pub fn capture_head_sha(repo_dir: &Path) -> GitResult<String> {
    let sha = run_stdout(repo_dir, ["rev-parse", "HEAD"])?;
    if sha.is_empty() {
        return Err(GitError::EmptyOutput {
            args: "rev-parse HEAD".into(),
        });
    }
    Ok(sha)
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    git_command(dir, None)
        .args(["rev-parse", "--is-inside-work-tree"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Resolve any revision to a full commit SHA.
pub fn resolve_commit(repo_dir: &Path, rev: &str) -> GitResult<String> {
    let spec = format!("{rev}^{{commit}}");
    run_stdout(repo_dir, ["rev-parse", "--verify", "--quiet", spec.as_str()])
}

/// Add a detached worktree at `path` checked out at `commit`.
pub fn worktree_add(repo_dir: &Path, path: &Path, commit: &str) -> GitResult<()> {
    run(
        repo_dir,
        [
            OsStr::new("worktree"),
            OsStr::new("add"),
            OsStr::new("--detach"),
            path.as_os_str(),
            OsStr::new(commit),
        ],
        None,
    )?;
    Ok(())
}

/// Remove a worktree and prune its administrative files.
pub fn worktree_remove(repo_dir: &Path, path: &Path) -> GitResult<()> {
    run(
        repo_dir,
        [
            OsStr::new("worktree"),
            OsStr::new("remove"),
            OsStr::new("--force"),
            path.as_os_str(),
        ],
        None,
    )?;
    run(repo_dir, ["worktree", "prune"], None)?;
    Ok(())
}

/// Stage `files` (everything when empty) and commit. Returns the new SHA.
pub fn commit(
    dir: &Path,
    message: &str,
    files: &[String],
    identity: &CommitIdentity,
) -> GitResult<String> {
    let mut add = vec!["add".to_string(), "-A".to_string(), "--".to_string()];
    add.extend(files.iter().cloned());
    run(dir, &add, None)?;

    let staged = git_command(dir, None)
        .args(["diff", "--cached", "--quiet"])
        .status()?;
    if staged.success() {
        return Err(GitError::NothingToCommit {
            message: message.to_string(),
        });
    }

    let mut args = identity_args(identity);
    args.extend([
        "commit".to_string(),
        "--no-verify".to_string(),
        "-m".to_string(),
        message.to_string(),
    ]);
    run(dir, &args, None)?;
    capture_head_sha(dir)
}

/// Export `base..HEAD` as mail patches into `out_dir`, one per commit.
pub fn format_patch(dir: &Path, base: &str, out_dir: &Path) -> GitResult<Vec<PathBuf>> {
    let range = format!("{base}..HEAD");
    let output = run(
        dir,
        [
            OsStr::new("format-patch"),
            OsStr::new("-o"),
            out_dir.as_os_str(),
            OsStr::new(range.as_str()),
        ],
        None,
    )?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            let p = PathBuf::from(l);
            if p.is_absolute() {
                p
            } else {
                dir.join(p)
            }
        })
        .collect())
}

/// Apply mail patches onto `dir`'s HEAD. A failed `am` is aborted so the
/// repository is left as it was; if the abort fails too the error says so.
pub fn am(dir: &Path, patches: &[PathBuf], identity: &CommitIdentity) -> GitResult<()> {
    let mut args: Vec<std::ffi::OsString> = identity_args(identity)
        .into_iter()
        .map(Into::into)
        .collect();
    args.push("am".into());
    args.extend(patches.iter().map(|p| p.as_os_str().to_os_string()));
    if let Err(e) = run(dir, &args, None) {
        if let Err(abort) = run(dir, ["am", "--abort"], None) {
            tracing::error!(dir = %dir.display(), error = %abort, "git am --abort failed");
            return Err(GitError::AmAbortFailed {
                apply: e.to_string(),
                abort: abort.to_string(),
            });
        }
        return Err(e);
    }
    Ok(())
}

/// Commits in `range`, oldest first.
pub fn rev_list(dir: &Path, range: &str) -> GitResult<Vec<String>> {
    let out = run_stdout(dir, ["rev-list", "--reverse", range])?;
    Ok(out
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// `git apply` a patch file inside `dir` with an environment overlay.
pub fn apply_patch(dir: &Path, patch: &Path, env: &EnvOverlay) -> GitResult<()> {
    run(
        dir,
        [OsStr::new("apply"), OsStr::new("--whitespace=nowarn"), patch.as_os_str()],
        Some(env),
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command as StdCommand;

    pub fn run_git(repo_dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
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
    pub fn make_git_repo() -> tempfile::TempDir {
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
}

#[cfg(test)]
mod tests {
    use super::test_support::{make_git_repo, run_git};
    use super::*;

    #[test]
    fn capture_head_sha_returns_40_hex_chars() {
        let repo = make_git_repo();
        let sha = capture_head_sha(repo.path()).unwrap();
        assert_eq!(sha.len(), 40, "SHA should be 40 hex chars, got: {sha}");
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn capture_head_sha_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(capture_head_sha(dir.path()).is_err());
    }

    #[test]
    fn is_git_repo_distinguishes_repos() {
        let repo = make_git_repo();
        assert!(is_git_repo(repo.path()));
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()));
    }

    #[test]
    fn resolve_commit_accepts_refs_and_rejects_garbage() {
        let repo = make_git_repo();
        let head = capture_head_sha(repo.path()).unwrap();
        assert_eq!(resolve_commit(repo.path(), "HEAD").unwrap(), head);
        assert_eq!(resolve_commit(repo.path(), &head[..10]).unwrap(), head);
        assert!(resolve_commit(repo.path(), "no-such-ref").is_err());
    }

    #[test]
    fn commit_refuses_empty_changes() {
        let repo = make_git_repo();
        let err = commit(repo.path(), "noop", &[], &CommitIdentity::default()).unwrap_err();
        assert!(matches!(err, GitError::NothingToCommit { .. }));
    }

    #[test]
    fn commit_format_patch_and_am_round_trip() {
        let source = make_git_repo();
        let base = capture_head_sha(source.path()).unwrap();

        // Clone before committing so the target sits at the same base.
        let target_parent = tempfile::tempdir().unwrap();
        let target = target_parent.path().join("target");
        run_git(
            target_parent.path(),
            &["clone", "-q", source.path().to_str().unwrap(), "target"],
        );

        std::fs::write(source.path().join("a.txt"), "one\n").unwrap();
        let identity = CommitIdentity::default();
        let sha = commit(source.path(), "add a", &["a.txt".into()], &identity).unwrap();
        assert_eq!(rev_list(source.path(), &format!("{base}..HEAD")).unwrap(), vec![sha]);

        let patches_dir = tempfile::tempdir().unwrap();
        let patches = format_patch(source.path(), &base, patches_dir.path()).unwrap();
        assert_eq!(patches.len(), 1);
        assert!(patches[0].exists());

        am(&target, &patches, &identity).unwrap();
        assert_eq!(std::fs::read_to_string(target.join("a.txt")).unwrap(), "one\n");
        assert_eq!(rev_list(&target, &format!("{base}..HEAD")).unwrap().len(), 1);
    }

    #[test]
    fn conflicting_am_is_aborted_cleanly() {
        let source = make_git_repo();
        let base = capture_head_sha(source.path()).unwrap();
        let target_parent = tempfile::tempdir().unwrap();
        let target = target_parent.path().join("target");
        run_git(
            target_parent.path(),
            &["clone", "-q", source.path().to_str().unwrap(), "target"],
        );

        let identity = CommitIdentity::default();
        std::fs::write(source.path().join("README.md"), "from source\n").unwrap();
        commit(source.path(), "edit readme", &["README.md".into()], &identity).unwrap();
        std::fs::write(target.join("README.md"), "from target\n").unwrap();
        commit(&target, "diverge readme", &["README.md".into()], &identity).unwrap();
        let target_head = capture_head_sha(&target).unwrap();

        let patches_dir = tempfile::tempdir().unwrap();
        let patches = format_patch(source.path(), &base, patches_dir.path()).unwrap();
        let err = am(&target, &patches, &identity).unwrap_err();
        assert!(matches!(err, GitError::Failed { .. }), "{err}");

        assert!(!target.join(".git/rebase-apply").exists());
        assert_eq!(capture_head_sha(&target).unwrap(), target_head);
        assert_eq!(
            std::fs::read_to_string(target.join("README.md")).unwrap(),
            "from target\n"
        );
    }
}
