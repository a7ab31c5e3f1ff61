//! The execution engine: composition root for dry runs and applies.
//!
//! `execute` runs the gates in a fixed order: lock, red-line re-validation,
//! review, policy, DAG build. Only after every gate passes does anything
//! touch a worktree. Whatever happens, the run directory ends up with a
//! sealed audit tape, an execution summary and a checksum manifest.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn, Instrument};

use crate::atomic::AtomicWriter;
use crate::audit::event;
use crate::config::EngineConfig;
use crate::context::{RunContext, EXECUTION_SUMMARY, PATCHES_DIR, RUN_TAPE, SANDBOX_PROOF};
use crate::domain::{DryExecutionResult, ExecutionIntent, ExecutionMode, ExecutionRequest};
use crate::error::{EngineError, ExecutionStatus};
use crate::git;
use crate::lock::{ExecutionLock, FsLockStore};
use crate::obs;
use crate::planner;
use crate::policy::{PolicyError, SandboxPolicy};
use crate::proof::{SandboxProof, SelfProvingCommitRecorder};
use crate::redline::{RedLineReport, RedLineValidator};
use crate::report::{Checksums, ExecutionSummary};
use crate::review::ReviewGate;
use crate::sandbox::{Sandbox, SandboxError, SandboxOperationRunner, VerifyingRunner};
use crate::scheduler::{DagScheduler, RunStatus, SchedulerOptions, SchedulerReport};

pub const DRY_RUN_FILE: &str = "dry_run.json";
pub const RED_LINE_REPORT_FILE: &str = "red_line_report.json";

/// Git operations that commit application needs the policy to allow.
pub const COMMIT_GIT_OPERATIONS: &[&str] = &["git_commit", "git_format_patch", "git_am"];

/// What a dry run produced and where it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunOutcome {
    pub result: DryExecutionResult,
    pub report: RedLineReport,
    pub result_path: PathBuf,
    pub report_path: PathBuf,
}

/// Outcome of one `execute` call. Failures after the run directory exists
/// are reported here rather than as `Err`, so the caller always learns where
/// the evidence is.
#[derive(Debug)]
pub struct ExecutionResult {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: ExecutionStatus,
    pub summary: ExecutionSummary,
    pub red_line: Option<RedLineReport>,
    pub scheduler: Option<SchedulerReport>,
    pub proof: Option<SandboxProof>,
    pub error: Option<EngineError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Mutable bookkeeping for one run, consumed by `finish`.
#[derive(Default)]
struct RunState {
    lock_held: bool,
    sandbox: Option<Sandbox>,
    red_line: Option<RedLineReport>,
    scheduler: Option<SchedulerReport>,
    proof: Option<SandboxProof>,
    commit_count: usize,
    patch_count: usize,
}

pub struct ExecutorEngine {
    config: EngineConfig,
    lock: ExecutionLock,
    review: ReviewGate,
}

impl ExecutorEngine {
    pub fn new(config: EngineConfig, lock: ExecutionLock, review: ReviewGate) -> Self {
        Self {
            config,
            lock,
            review,
        }
    }

    /// Engine with a filesystem lock store and review gate taken from
    /// `config`.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let lock = ExecutionLock::new(Arc::new(FsLockStore::new(&config.lock_dir)?));
        let review = ReviewGate::new(&config.review_dir);
        Ok(Self::new(config, lock, review))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    pub fn review(&self) -> &ReviewGate {
        &self.review
    }

    /// Plan `intent`, validate the result and persist both atomically under
    /// `output_dir`. A failing report is still written.
    #[instrument(skip(self, intent, output_dir), fields(intent_id = %intent.intent_id))]
    pub fn dry_run(
        &self,
        intent: &ExecutionIntent,
        output_dir: &Path,
    ) -> Result<DryRunOutcome, EngineError> {
        let result = planner::dry_run(
            intent,
            vec![PathBuf::from(DRY_RUN_FILE), PathBuf::from(RED_LINE_REPORT_FILE)],
        )?;
        let report = RedLineValidator::new(output_dir).validate(&result, Some(intent));

        std::fs::create_dir_all(output_dir)?;
        let result_path = output_dir.join(DRY_RUN_FILE);
        let report_path = output_dir.join(RED_LINE_REPORT_FILE);
        AtomicWriter::write_json(&result_path, &result)?;
        AtomicWriter::write_json(&report_path, &report)?;
        info!(
            valid = report.valid,
            nodes = result.graph.nodes.len(),
            patches = result.patch_plan.files.len(),
            "dry run persisted"
        );

        Ok(DryRunOutcome {
            result,
            report,
            result_path,
            report_path,
        })
    }

    /// Execute `request` under `policy`.
    ///
    /// Returns `Err` only when the run directory itself cannot be set up or
    /// its artifacts cannot be persisted. Every other failure is audited and
    /// returned in [`ExecutionResult::error`] with the matching status.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        policy: &SandboxPolicy,
    ) -> Result<ExecutionResult, EngineError> {
        let ctx = RunContext::create(
            &self.config.output_root,
            &request.execution_request_id,
            &request.repo.repo_id,
        )?;
        let run_id = ctx.run_id_str();
        obs::emit_run_started(&run_id, &request.execution_request_id, &request.repo.repo_id);
        ctx.record(
            event::RUN_STARTED,
            json!({
                "run_id": run_id,
                "execution_request_id": request.execution_request_id,
                "repo_id": request.repo.repo_id,
                "mode": request.execution_mode,
                "policy_id": policy.policy_id(),
            }),
        )?;

        let mut state = RunState::default();
        let outcome = self
            .run(&ctx, request, policy, &mut state)
            .instrument(obs::run_span(&run_id))
            .await;
        self.finish(&ctx, state, outcome).await
    }

    async fn run(
        &self,
        ctx: &RunContext,
        request: &ExecutionRequest,
        policy: &SandboxPolicy,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        self.acquire_lock(ctx, state).await?;
        check_request_shape(request)?;
        let report = self.revalidate(ctx, request)?;
        state.red_line = Some(report);
        self.check_review(ctx, request)?;
        check_policy(ctx, request, policy)?;
        let scheduler = DagScheduler::build(request.operations.clone())?
            .with_audit(Arc::clone(&ctx.audit));

        if request.execution_mode == ExecutionMode::DryRun {
            info!("dry_run mode: all pre-mutation checks passed");
            return Ok(());
        }

        let mut sandbox = Sandbox::new(&request.repo.path, &request.repo.base_commit)?
            .with_identity(self.config.commit_identity.clone());
        sandbox.ensure_target_at_base()?;
        let parent = self
            .config
            .worktree_root
            .clone()
            .unwrap_or_else(|| ctx.layout.root().join("worktree"));
        let root = sandbox.create(&parent)?.to_path_buf();
        ctx.record(
            event::SANDBOX_CREATED,
            json!({ "path": root.display().to_string(), "base_commit": sandbox.base_commit() }),
        )?;
        let sandbox = state.sandbox.insert(sandbox);

        let boundary = sandbox.boundary().cloned().ok_or(SandboxError::NotCreated)?;
        let runner = Arc::new(
            SandboxOperationRunner::new(boundary)
                .with_limits(policy.max_file_size(), policy.max_files()),
        );
        let verifying = VerifyingRunner::new(runner, policy.diff_verifier()?)
            .with_audit(Arc::clone(&ctx.audit));
        let report = scheduler
            .execute(
                Arc::new(verifying),
                SchedulerOptions {
                    max_concurrency: self.config.max_concurrency,
                    deadline: policy.timeout(),
                },
            )
            .await?;
        let failed: Vec<String> = report.failed().into_iter().map(String::from).collect();
        let timed_out = report.timed_out;
        let status = report.status;
        state.scheduler = Some(report);
        if timed_out {
            return Err(EngineError::Timeout { failed });
        }
        if status == RunStatus::Failed {
            return Err(EngineError::OperationFailed { failed });
        }

        let proof = self.land_commits(
            ctx,
            request,
            sandbox,
            &mut state.commit_count,
            &mut state.patch_count,
        )?;
        state.proof = Some(proof);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        ctx: &RunContext,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let run_id = ctx.run_id_str();
        let acquired = self
            .lock
            .acquire(&run_id, &ctx.repo_id, self.config.lock_ttl())
            .await?;
        if !acquired {
            let holder = self
                .lock
                .holder(&ctx.repo_id)
                .await
                .ok()
                .flatten()
                .map(|row| row.run_id);
            obs::emit_lock_contention(&ctx.repo_id, holder.as_deref());
            ctx.record(
                event::LOCK_CONTENTION,
                json!({ "repo_id": ctx.repo_id, "holder": holder }),
            )?;
            return Err(EngineError::LockContention {
                repo_id: ctx.repo_id.clone(),
                holder,
            });
        }
        state.lock_held = true;
        ctx.record(
            event::LOCK_ACQUIRED,
            json!({ "repo_id": ctx.repo_id, "ttl_secs": self.config.lock_ttl_secs }),
        )?;
        Ok(())
    }

    fn revalidate(
        &self,
        ctx: &RunContext,
        request: &ExecutionRequest,
    ) -> Result<RedLineReport, EngineError> {
        let dry = request.dry_run.as_ref().ok_or_else(|| {
            EngineError::InvalidRequest("request carries no validated dry run".into())
        })?;
        let report = RedLineValidator::new(ctx.layout.root())
            .with_source_root(&request.repo.path)
            .validate(dry, request.intent.as_ref());
        // Without an intent the provenance check (DE3) has nothing to compare
        // against; the tape says so instead of implying it passed.
        let provenance_checked = request.intent.is_some();
        if !provenance_checked {
            warn!(
                execution_request_id = %request.execution_request_id,
                "request carries no intent; plan provenance not checked"
            );
        }
        ctx.record(
            event::RED_LINE_EVALUATED,
            json!({
                "valid": report.valid,
                "violations": report.violations,
                "provenance_checked": provenance_checked,
            }),
        )?;
        if !report.valid {
            return Err(EngineError::RedLineViolation {
                report: Box::new(report),
            });
        }
        if !dry.checksum_matches() {
            return Err(EngineError::ChecksumMismatch);
        }
        check_request_matches_dry_run(request, dry)?;
        Ok(report)
    }

    fn check_review(
        &self,
        ctx: &RunContext,
        request: &ExecutionRequest,
    ) -> Result<(), EngineError> {
        if !self.review.requires_review(request) {
            ctx.record(event::REVIEW_CHECKED, json!({ "required": false }))?;
            return Ok(());
        }
        let approval = self.review.check_approval(&request.execution_request_id)?;
        ctx.record(
            event::REVIEW_CHECKED,
            json!({
                "required": true,
                "approved": approval.is_some(),
                "approver": approval.as_ref().map(|a| a.approver.clone()),
            }),
        )?;
        if approval.is_none() {
            return Err(EngineError::ReviewRequired {
                execution_request_id: request.execution_request_id.clone(),
            });
        }
        Ok(())
    }

    /// Commit each plan step in the worktree, export and land the patches,
    /// then prove the three commit sets line up.
    fn land_commits(
        &self,
        ctx: &RunContext,
        request: &ExecutionRequest,
        sandbox: &Sandbox,
        commit_count: &mut usize,
        patch_count: &mut usize,
    ) -> Result<SandboxProof, EngineError> {
        let steps = &request.commit_plan.steps;
        let mut recorder = SelfProvingCommitRecorder::new(sandbox.base_commit(), steps.len());

        for step in steps {
            let sha = sandbox.commit(&step.message, &step.file_set)?;
            ctx.record(
                event::COMMIT_CREATED,
                json!({ "sha": sha, "message": step.message, "files": step.file_set }),
            )?;
            recorder.record_worktree_commit(sha);
            *commit_count += 1;
        }

        let mut landed = Vec::new();
        if !steps.is_empty() {
            let patches = sandbox.format_patch(&ctx.layout.patches_dir())?;
            for patch in &patches {
                recorder.record_patch(patch)?;
            }
            *patch_count = patches.len();

            sandbox.ensure_target_at_base()?;
            git::am(sandbox.repo(), &patches, &self.config.commit_identity)?;
            landed = git::rev_list(
                sandbox.repo(),
                &format!("{}..HEAD", sandbox.base_commit()),
            )?;
            ctx.record(
                event::PATCHES_APPLIED,
                json!({ "patches": patches.len(), "landed": landed }),
            )?;
        }
        recorder.record_landed_commits(landed);

        let proof = recorder.finalize(sandbox.head_sha()?)?;
        ctx.record(
            event::PROOF_RECORDED,
            json!({
                "patch_count": proof.patch_count,
                "worktree_head_sha": proof.worktree_head_sha,
            }),
        )?;
        Ok(proof)
    }

    /// Tear down, then persist every artifact. Runs on success and failure.
    async fn finish(
        &self,
        ctx: &RunContext,
        mut state: RunState,
        outcome: Result<(), EngineError>,
    ) -> Result<ExecutionResult, EngineError> {
        let run_id = ctx.run_id_str();
        let sandbox_used = state.sandbox.is_some();

        if let Some(mut sandbox) = state.sandbox.take() {
            match sandbox.remove() {
                Ok(()) => {
                    ctx.record(event::SANDBOX_REMOVED, json!({}))?;
                }
                Err(e) => warn!(error = %e, "failed to remove sandbox worktree"),
            }
        }
        if state.lock_held {
            match self.lock.release(&run_id, &ctx.repo_id).await {
                Ok(released) => {
                    ctx.record(event::LOCK_RELEASED, json!({ "released": released }))?;
                }
                Err(e) => warn!(error = %e, "failed to release execution lock"),
            }
        }

        let status = match &outcome {
            Ok(()) => ExecutionStatus::Success,
            Err(e) => e.status(),
        };
        let error = outcome.err();
        if let Some(e) = &error {
            obs::emit_run_failed(&run_id, e);
            ctx.record(
                event::RUN_FAILED,
                json!({ "status": status, "error": e.to_string() }),
            )?;
        }

        if let Some(proof) = &state.proof {
            AtomicWriter::write_json(&ctx.layout.sandbox_proof(), proof)?;
        }
        let summary = ExecutionSummary {
            execution_request_id: ctx.execution_request_id.clone(),
            run_id: run_id.clone(),
            status,
            commit_count: state.commit_count,
            patch_count: state.patch_count,
            sandbox_used,
            error: error.as_ref().map(ToString::to_string),
        };
        AtomicWriter::write_json(&ctx.layout.execution_summary(), &summary)?;

        let duration_ms = ctx.elapsed_ms();
        ctx.record(
            event::RUN_FINISHED,
            json!({ "status": status, "duration_ms": duration_ms }),
        )?;
        AtomicWriter::seal(&ctx.layout.run_tape())?;
        write_checksums(ctx)?;
        obs::emit_run_finished(&run_id, status.as_str(), duration_ms);

        Ok(ExecutionResult {
            run_id,
            run_dir: ctx.layout.root().to_path_buf(),
            status,
            summary,
            red_line: state.red_line,
            scheduler: state.scheduler,
            proof: state.proof,
            error,
        })
    }
}

fn check_request_shape(request: &ExecutionRequest) -> Result<(), EngineError> {
    if request.execution_request_id.trim().is_empty() {
        return Err(EngineError::InvalidRequest(
            "execution_request_id must not be empty".into(),
        ));
    }
    let major = request.schema_version.split('.').next().unwrap_or_default();
    if major != "1" {
        return Err(EngineError::InvalidRequest(format!(
            "unsupported schema_version {}",
            request.schema_version
        )));
    }
    Ok(())
}

/// The operations and plans being applied must be exactly the ones the
/// validated dry run describes.
fn check_request_matches_dry_run(
    request: &ExecutionRequest,
    dry: &DryExecutionResult,
) -> Result<(), EngineError> {
    if request.patch_plan != dry.patch_plan || request.commit_plan != dry.commit_plan {
        return Err(EngineError::InvalidRequest(
            "patch or commit plan differs from the validated dry run".into(),
        ));
    }
    if request.operations.len() != dry.graph.nodes.len() {
        return Err(EngineError::InvalidRequest(format!(
            "request has {} operations but the dry run graph has {} nodes",
            request.operations.len(),
            dry.graph.nodes.len()
        )));
    }
    for op in &request.operations {
        let Some(node) = dry.graph.node(&op.op_id) else {
            return Err(EngineError::InvalidRequest(format!(
                "operation {} is not in the validated dry run",
                op.op_id
            )));
        };
        let mut declared = dry.graph.dependencies_of(&op.op_id);
        let mut actual = op.depends_on.clone();
        declared.sort();
        actual.sort();
        let attrs = Value::Object(
            node.attrs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        if node.node_type != op.action || declared != actual || attrs != op.params {
            return Err(EngineError::InvalidRequest(format!(
                "operation {} differs from its dry run node",
                op.op_id
            )));
        }
    }
    Ok(())
}

fn check_policy(
    ctx: &RunContext,
    request: &ExecutionRequest,
    policy: &SandboxPolicy,
) -> Result<(), EngineError> {
    let deny = |err: PolicyError| -> Result<(), EngineError> {
        if let PolicyError::Denied { operation, reason } = &err {
            obs::emit_policy_denied(operation, reason);
            ctx.record(
                event::POLICY_DENIED,
                json!({ "operation": operation, "reason": reason }),
            )?;
        }
        Err(err.into())
    };

    for op in &request.operations {
        if let Err(e) = policy.assert_operation_allowed(&op.action, &op.params) {
            return deny(e);
        }
    }
    for step in &request.commit_plan.steps {
        for git_op in COMMIT_GIT_OPERATIONS {
            if let Err(e) = policy.assert_operation_allowed(git_op, &Value::Null) {
                return deny(e);
            }
        }
        for file in &step.file_set {
            if let Err(e) = policy.assert_operation_allowed("git_commit", &json!({ "path": file }))
            {
                return deny(e);
            }
        }
    }

    let touched: BTreeSet<&str> = request
        .patch_plan
        .paths()
        .chain(
            request
                .commit_plan
                .steps
                .iter()
                .flat_map(|s| s.file_set.iter().map(String::as_str)),
        )
        .collect();
    if let Some(limit) = policy.max_files() {
        if touched.len() > limit {
            return deny(PolicyError::Denied {
                operation: "max_files".into(),
                reason: format!("plan touches {} files, limit is {limit}", touched.len()),
            });
        }
    }

    ctx.record(
        event::POLICY_CHECKED,
        json!({
            "policy_id": policy.policy_id(),
            "operations": request.operations.len(),
            "files": touched.len(),
        }),
    )?;
    Ok(())
}

fn write_checksums(ctx: &RunContext) -> Result<(), EngineError> {
    let mut relative: Vec<String> = vec![
        RUN_TAPE.to_string(),
        SANDBOX_PROOF.to_string(),
        EXECUTION_SUMMARY.to_string(),
    ];
    let mut patches: Vec<String> = std::fs::read_dir(ctx.layout.patches_dir())?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".patch"))
        .map(|name| format!("{PATCHES_DIR}/{name}"))
        .collect();
    patches.sort();
    relative.extend(patches);

    let checksums = Checksums::collect(ctx.layout.root(), relative.iter().map(String::as_str))?;
    AtomicWriter::write_json(&ctx.layout.checksums(), &checksums)?;
    Ok(())
}
