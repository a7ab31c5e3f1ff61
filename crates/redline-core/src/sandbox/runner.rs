//! Operation runners that act on the sandbox worktree.
//!
//! [`SandboxOperationRunner`] performs file operations inside a
//! [`WorktreeBoundary`] and reports each change as a unified diff.
//! [`VerifyingRunner`] wraps any runner and fails an operation whose diff
//! does not pass the [`DiffVerifier`].

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use super::worktree::WorktreeBoundary;
use crate::audit::{event, AuditLog};
use crate::diff_verify::{render_replacement_diff, DiffVerifier};
use crate::git::{self, EnvOverlay};
use crate::policy::{is_protected_env_var, PathMatcher};
use crate::scheduler::{Operation, OperationFailure, OperationOutput, OperationRunner};

/// Actions understood by [`SandboxOperationRunner`].
pub const SUPPORTED_ACTIONS: &[&str] = &[
    "write_file",
    "delete_file",
    "mkdir",
    "apply_patch",
    "set_env",
    "unset_env",
];

type OpResult = Result<OperationOutput, OperationFailure>;

fn fail(reason: impl Into<String>) -> OperationFailure {
    OperationFailure::new(reason)
}

#[derive(Debug)]
pub struct SandboxOperationRunner {
    boundary: WorktreeBoundary,
    max_file_size: Option<u64>,
    max_files: Option<usize>,
    touched: Mutex<BTreeSet<String>>,
    env: Mutex<EnvOverlay>,
}

impl SandboxOperationRunner {
    pub fn new(boundary: WorktreeBoundary) -> Self {
        Self {
            boundary,
            max_file_size: None,
            max_files: None,
            touched: Mutex::new(BTreeSet::new()),
            env: Mutex::new(EnvOverlay::new()),
        }
    }

    pub fn with_limits(mut self, max_file_size: Option<u64>, max_files: Option<usize>) -> Self {
        self.max_file_size = max_file_size;
        self.max_files = max_files;
        self
    }

    /// Files changed so far, repository-relative.
    pub fn touched_files(&self) -> Vec<String> {
        self.touched
            .lock()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Environment overlay accumulated from `set_env` / `unset_env`.
    pub fn env_overlay(&self) -> EnvOverlay {
        self.env.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn path_param<'a>(&self, op: &'a Operation) -> Result<&'a str, OperationFailure> {
        op.param_str("path")
            .ok_or_else(|| fail(format!("{} requires a string `path` param", op.action)))
    }

    fn resolve(&self, relative: &str) -> Result<(String, std::path::PathBuf), OperationFailure> {
        self.boundary
            .resolve(relative)
            .map_err(|e| fail(e.to_string()))
    }

    /// Count `path` against `max_files`.
    fn reserve(&self, path: &str) -> Result<(), OperationFailure> {
        let mut touched = self
            .touched
            .lock()
            .map_err(|_| fail("touched-file set poisoned"))?;
        if touched.contains(path) {
            return Ok(());
        }
        if let Some(limit) = self.max_files {
            if touched.len() >= limit {
                return Err(fail(format!(
                    "max_files limit of {limit} reached; refusing to touch {path}"
                )));
            }
        }
        touched.insert(path.to_string());
        Ok(())
    }

    fn check_size(&self, path: &str, size: u64) -> Result<(), OperationFailure> {
        match self.max_file_size {
            Some(limit) if size > limit => Err(fail(format!(
                "{path} is {size} bytes, above the max_file_size limit of {limit}"
            ))),
            _ => Ok(()),
        }
    }

    async fn write_file(&self, op: &Operation) -> OpResult {
        let path = self.path_param(op)?;
        let content = op
            .param_str("content")
            .ok_or_else(|| fail("write_file requires a string `content` param"))?;
        let (rel, abs) = self.resolve(path)?;
        self.check_size(&rel, content.len() as u64)?;
        self.reserve(&rel)?;

        let old = read_text(&abs).await?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fail(format!("create parent of {rel}: {e}")))?;
        }
        tokio::fs::write(&abs, content.as_bytes())
            .await
            .map_err(|e| fail(format!("write {rel}: {e}")))?;

        let diff = render_replacement_diff(&rel, old.as_deref(), Some(content));
        Ok(OperationOutput {
            diff: (!diff.is_empty()).then_some(diff),
            touched_files: vec![rel],
            detail: None,
        })
    }

    async fn delete_file(&self, op: &Operation) -> OpResult {
        let (rel, abs) = self.resolve(self.path_param(op)?)?;
        let old = read_text(&abs)
            .await?
            .ok_or_else(|| fail(format!("delete_file: {rel} does not exist")))?;
        self.reserve(&rel)?;
        tokio::fs::remove_file(&abs)
            .await
            .map_err(|e| fail(format!("delete {rel}: {e}")))?;
        Ok(OperationOutput {
            diff: Some(render_replacement_diff(&rel, Some(&old), None)),
            touched_files: vec![rel],
            detail: None,
        })
    }

    async fn mkdir(&self, op: &Operation) -> OpResult {
        let (rel, abs) = self.resolve(self.path_param(op)?)?;
        tokio::fs::create_dir_all(&abs)
            .await
            .map_err(|e| fail(format!("mkdir {rel}: {e}")))?;
        Ok(OperationOutput {
            diff: None,
            touched_files: Vec::new(),
            detail: Some(format!("created directory {rel}")),
        })
    }

    async fn apply_patch(&self, op: &Operation) -> OpResult {
        let patch = op
            .param_str("patch")
            .or_else(|| op.param_str("diff"))
            .ok_or_else(|| fail("apply_patch requires a string `patch` param"))?
            .to_string();

        let report = DiffVerifier::new(PathMatcher::empty(), PathMatcher::empty()).verify(&patch, &[]);
        if !report.is_valid {
            return Err(fail(format!(
                "apply_patch: malformed patch: {}",
                report.errors.join("; ")
            )));
        }
        let mut touched = Vec::new();
        for file in &report.files {
            let (rel, _) = self.resolve(file)?;
            self.reserve(&rel)?;
            touched.push(rel);
        }

        let root = self.boundary.root().to_path_buf();
        let env = self.env_overlay();
        let body = report.normalized_diff.clone();
        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let mut file = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
            file.write_all(body.as_bytes()).map_err(|e| e.to_string())?;
            file.flush().map_err(|e| e.to_string())?;
            git::apply_patch(&root, file.path(), &env).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| fail(format!("apply_patch task failed: {e}")))?
        .map_err(|e| fail(format!("apply_patch: {e}")))?;

        for rel in &touched {
            let (_, abs) = self.resolve(rel)?;
            if let Ok(meta) = tokio::fs::metadata(&abs).await {
                self.check_size(rel, meta.len())?;
            }
        }

        Ok(OperationOutput {
            diff: Some(report.normalized_diff),
            touched_files: touched,
            detail: None,
        })
    }

    fn set_env(&self, op: &Operation, value: Option<String>) -> OpResult {
        let name = op
            .param_str("name")
            .ok_or_else(|| fail(format!("{} requires a string `name` param", op.action)))?;
        if is_protected_env_var(name) {
            return Err(fail(format!("environment variable {name} is protected")));
        }
        let mut env = self.env.lock().map_err(|_| fail("env overlay poisoned"))?;
        let detail = match &value {
            Some(_) => format!("set {name}"),
            None => format!("unset {name}"),
        };
        env.insert(name.to_string(), value);
        Ok(OperationOutput {
            diff: None,
            touched_files: Vec::new(),
            detail: Some(detail),
        })
    }
}

async fn read_text(path: &Path) -> Result<Option<String>, OperationFailure> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(fail(format!("read {}: {e}", path.display()))),
    }
}

#[async_trait]
impl OperationRunner for SandboxOperationRunner {
    async fn run(&self, op: &Operation) -> OpResult {
        match op.action.as_str() {
            "write_file" => self.write_file(op).await,
            "delete_file" => self.delete_file(op).await,
            "mkdir" => self.mkdir(op).await,
            "apply_patch" => self.apply_patch(op).await,
            "set_env" => {
                let value = op
                    .param_str("value")
                    .ok_or_else(|| fail("set_env requires a string `value` param"))?;
                self.set_env(op, Some(value.to_string()))
            }
            "unset_env" => self.set_env(op, None),
            other => Err(fail(format!("unsupported action: {other}"))),
        }
    }
}

/// Re-verifies every diff an inner runner produces.
pub struct VerifyingRunner {
    inner: Arc<dyn OperationRunner>,
    verifier: DiffVerifier,
    audit: Option<Arc<AuditLog>>,
}

impl VerifyingRunner {
    pub fn new(inner: Arc<dyn OperationRunner>, verifier: DiffVerifier) -> Self {
        Self {
            inner,
            verifier,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }
}

#[async_trait]
impl OperationRunner for VerifyingRunner {
    async fn run(&self, op: &Operation) -> OpResult {
        let output = self.inner.run(op).await?;
        let Some(diff) = &output.diff else {
            return Ok(output);
        };
        let report = self.verifier.verify(diff, &output.touched_files);
        if let Some(audit) = &self.audit {
            let details = json!({
                "op_id": op.op_id,
                "is_valid": report.is_valid,
                "errors": report.errors,
                "warnings": report.warnings,
                "normalized_from_format_patch": report.normalized_from_format_patch,
                "normalized_start_line": report.normalized_start_line,
                "files": report.files,
            });
            if let Err(e) = audit.append(event::DIFF_VERIFIED, details) {
                warn!(op_id = %op.op_id, error = %e, "failed to audit diff verification");
            }
        }
        if !report.is_valid {
            return Err(fail(format!(
                "diff verification failed: {}",
                report.errors.join("; ")
            )));
        }
        Ok(output)
    }
}
