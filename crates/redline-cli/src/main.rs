//! Redline - execution safety and scheduling engine CLI
//!
//! The `redline` command plans, validates and applies evidence-backed change
//! intents.
//!
//! ## Commands
//!
//! - `plan`: Dry-run an intent and write the plan plus its red-line report
//! - `validate`: Re-check a persisted dry run against the red lines
//! - `execute`: Run an execution request (or an intent) under a policy
//! - `approve`: Record a human approval for a request
//! - `verify`: Re-check a finished run directory's markers and proof
//! - `policy check`: Schema-validate a sandbox policy file
//!
//! The process exit code is the run status code (0 on success).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use redline_core::atomic::AtomicWriter;
use redline_core::context::{RunLayout, CHECKSUMS, EXECUTION_SUMMARY, RUN_TAPE, SANDBOX_PROOF};
use redline_core::{
    planner, verify_proof, Checksums, DryExecutionResult, EngineConfig, EngineError,
    ExecutionIntent, ExecutionMode, ExecutionRequest, ExecutionStatus, ExecutorEngine,
    RedLineValidator, RepoTarget, ReviewGate, SandboxPolicy, SandboxProof,
};

#[derive(Parser)]
#[command(name = "redline")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Execution safety & scheduling engine", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Root directory for run directories
    #[arg(long, global = true, env = "REDLINE_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,

    /// Directory holding execution lock rows
    #[arg(long, global = true, env = "REDLINE_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    /// Directory holding approvals.jsonl
    #[arg(long, global = true, env = "REDLINE_REVIEW_DIR")]
    review_dir: Option<PathBuf>,

    /// Parent directory for sandbox worktrees (default: the run directory)
    #[arg(long, global = true, env = "REDLINE_WORKTREE_ROOT")]
    worktree_root: Option<PathBuf>,

    /// Maximum concurrently running operations
    #[arg(long, global = true, env = "REDLINE_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Execution lock TTL in seconds
    #[arg(long, global = true, env = "REDLINE_LOCK_TTL_SECS")]
    lock_ttl_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run an intent: plan it, validate the red lines, persist both
    Plan {
        /// Path to the execution intent (JSON)
        #[arg(short, long)]
        intent: PathBuf,

        /// Directory to write dry_run.json and red_line_report.json into
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Validate a persisted dry run against the red lines
    Validate {
        /// Path to dry_run.json
        dry_run: PathBuf,

        /// Intent the dry run came from (enables the path provenance check)
        #[arg(short, long)]
        intent: Option<PathBuf>,

        /// Output directory declared outputs must stay inside
        /// (default: the dry run's directory)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Source tree declared outputs must never touch
        #[arg(long)]
        source_root: Option<PathBuf>,
    },

    /// Execute a request under a sandbox policy
    Execute {
        /// Path to the sandbox policy (JSON)
        #[arg(short, long)]
        policy: PathBuf,

        /// Path to an execution request (JSON)
        #[arg(long, conflicts_with = "intent")]
        request: Option<PathBuf>,

        /// Build the request from this intent instead
        #[arg(long, requires = "repo")]
        intent: Option<PathBuf>,

        /// Target repository (with --intent)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Repository id used as the lock key (default: the repo path)
        #[arg(long)]
        repo_id: Option<String>,

        /// Base commit for the sandbox (with --intent)
        #[arg(long, default_value = "HEAD")]
        base_commit: String,

        /// Execution request id (with --intent; default: req-<intent_id>)
        #[arg(long)]
        request_id: Option<String>,

        /// Apply the plan (otherwise only pre-mutation checks run)
        #[arg(long)]
        apply: bool,
    },

    /// Record a human approval for an execution request
    Approve {
        /// Execution request id
        request_id: String,

        /// Who approves
        #[arg(short, long)]
        approver: String,

        /// Optional note
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Verify a finished run directory: integrity markers, checksums, proof
    Verify {
        /// Run directory (<output_root>/<run_id>)
        run_dir: PathBuf,
    },

    /// Sandbox policy tools
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Schema-validate a policy file
    Check {
        /// Path to the policy (JSON)
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    redline_core::telemetry::init_logging(cli.verbose, cli.json);

    let status = match run(cli).await {
        Ok(status) => status,
        Err(err) => {
            eprintln!("error: {err:#}");
            status_of(&err)
        }
    };
    ExitCode::from(u8::try_from(status.exit_code()).unwrap_or(1))
}

async fn run(cli: Cli) -> Result<ExecutionStatus> {
    let config = engine_config(&cli);
    match cli.command {
        Commands::Plan { intent, out } => cmd_plan(&config, &intent, &out),
        Commands::Validate {
            dry_run,
            intent,
            output_dir,
            source_root,
        } => cmd_validate(
            &dry_run,
            intent.as_deref(),
            output_dir.as_deref(),
            source_root.as_deref(),
        ),
        Commands::Execute {
            policy,
            request,
            intent,
            repo,
            repo_id,
            base_commit,
            request_id,
            apply,
        } => {
            let mode = if apply {
                ExecutionMode::Apply
            } else {
                ExecutionMode::DryRun
            };
            let request = match (request, intent, repo) {
                (Some(path), _, _) => load_request(&path)?,
                (None, Some(intent), Some(repo)) => request_from_intent(
                    &load_intent(&intent)?,
                    &repo,
                    repo_id,
                    &base_commit,
                    request_id,
                    mode,
                )?,
                _ => anyhow::bail!("execute needs --request, or --intent with --repo"),
            };
            cmd_execute(config, &policy, request).await
        }
        Commands::Approve {
            request_id,
            approver,
            note,
        } => cmd_approve(&config, &request_id, &approver, note),
        Commands::Verify { run_dir } => cmd_verify(&run_dir),
        Commands::Policy { action } => match action {
            PolicyAction::Check { path } => cmd_policy_check(&path),
        },
    }
}

/// `REDLINE_*` environment defaults, overridden by explicit flags.
fn engine_config(cli: &Cli) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if let Some(v) = &cli.output_root {
        config.output_root = v.clone();
    }
    if let Some(v) = &cli.lock_dir {
        config.lock_dir = v.clone();
    }
    if let Some(v) = &cli.review_dir {
        config.review_dir = v.clone();
    }
    if let Some(v) = &cli.worktree_root {
        config.worktree_root = Some(v.clone());
    }
    if let Some(v) = cli.max_concurrency {
        config.max_concurrency = v.max(1);
    }
    if let Some(v) = cli.lock_ttl_secs {
        config.lock_ttl_secs = v;
    }
    config
}

/// Map an error chain to the status the process exits with.
fn status_of(err: &anyhow::Error) -> ExecutionStatus {
    err.downcast_ref::<EngineError>()
        .map(EngineError::status)
        .unwrap_or(ExecutionStatus::InternalError)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_intent(path: &Path) -> Result<ExecutionIntent> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read intent: {}", path.display()))?;
    ExecutionIntent::from_json(&raw)
        .map_err(|e| EngineError::InvalidRequest(format!("intent is malformed: {e}")))
        .with_context(|| format!("Invalid intent: {}", path.display()))
}

fn load_request(path: &Path) -> Result<ExecutionRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request: {}", path.display()))?;
    ExecutionRequest::from_json(&raw)
        .map_err(|e| EngineError::InvalidRequest(format!("request is malformed: {e}")))
        .with_context(|| format!("Invalid request: {}", path.display()))
}

fn load_policy(path: &Path) -> Result<SandboxPolicy> {
    SandboxPolicy::load(path)
        .map_err(EngineError::from)
        .with_context(|| format!("Failed to load policy: {}", path.display()))
}

/// Plan `intent` and wrap it as a request against `repo`.
fn request_from_intent(
    intent: &ExecutionIntent,
    repo: &Path,
    repo_id: Option<String>,
    base_commit: &str,
    request_id: Option<String>,
    mode: ExecutionMode,
) -> Result<ExecutionRequest> {
    let dry_run = planner::dry_run(intent, Vec::new()).map_err(EngineError::from)?;
    let repo_id = repo_id.unwrap_or_else(|| repo.display().to_string());
    let request_id = request_id.unwrap_or_else(|| format!("req-{}", intent.intent_id));
    Ok(ExecutionRequest::from_dry_run(
        request_id,
        RepoTarget {
            repo_id,
            path: repo.to_path_buf(),
            base_commit: base_commit.to_string(),
        },
        mode,
        dry_run,
        Some(intent.clone()),
    ))
}

fn cmd_plan(config: &EngineConfig, intent_path: &Path, out: &Path) -> Result<ExecutionStatus> {
    let intent = load_intent(intent_path)?;
    let engine = ExecutorEngine::from_config(config.clone())?;
    let outcome = engine.dry_run(&intent, out)?;
    info!(
        dry_run = %outcome.result_path.display(),
        report = %outcome.report_path.display(),
        "dry run written"
    );
    print_json(&outcome.report)?;
    Ok(if outcome.report.valid {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::RedLineViolation
    })
}

fn cmd_validate(
    dry_run_path: &Path,
    intent_path: Option<&Path>,
    output_dir: Option<&Path>,
    source_root: Option<&Path>,
) -> Result<ExecutionStatus> {
    let raw = std::fs::read_to_string(dry_run_path)
        .with_context(|| format!("Failed to read dry run: {}", dry_run_path.display()))?;
    let result: DryExecutionResult = serde_json::from_str(&raw)
        .map_err(|e| EngineError::InvalidRequest(format!("dry run is malformed: {e}")))?;
    let intent = intent_path.map(load_intent).transpose()?;

    let output_dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| dry_run_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let mut validator = RedLineValidator::new(&output_dir);
    if let Some(root) = source_root {
        validator = validator.with_source_root(root);
    }
    let report = validator.validate(&result, intent.as_ref());
    print_json(&report)?;
    Ok(if report.valid {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::RedLineViolation
    })
}

async fn cmd_execute(
    config: EngineConfig,
    policy_path: &Path,
    request: ExecutionRequest,
) -> Result<ExecutionStatus> {
    let policy = load_policy(policy_path)?;
    let engine = ExecutorEngine::from_config(config)?;
    let result = engine
        .execute(&request, &policy)
        .await
        .context("Execution could not be recorded")?;

    info!(
        run_id = %result.run_id,
        run_dir = %result.run_dir.display(),
        status = %result.status,
        "run finished"
    );
    print_json(&result.summary)?;
    if let Some(err) = &result.error {
        eprintln!("run failed: {err}");
    }
    Ok(result.status)
}

fn cmd_approve(
    config: &EngineConfig,
    request_id: &str,
    approver: &str,
    note: Option<String>,
) -> Result<ExecutionStatus> {
    let gate = ReviewGate::new(&config.review_dir);
    let record = gate
        .approve(request_id, approver, note)
        .map_err(EngineError::from)
        .context("Failed to record approval")?;
    print_json(&record)?;
    Ok(ExecutionStatus::Success)
}

/// Check every sealed artifact's marker, the checksum manifest and, when
/// present, the sandbox proof against the exported patches.
fn cmd_verify(run_dir: &Path) -> Result<ExecutionStatus> {
    if !run_dir.is_dir() {
        anyhow::bail!("Run directory not found: {}", run_dir.display());
    }
    let layout = RunLayout::new(run_dir);

    for rel in [RUN_TAPE, EXECUTION_SUMMARY, CHECKSUMS] {
        AtomicWriter::verify(&run_dir.join(rel))
            .map_err(EngineError::from)
            .with_context(|| format!("Integrity check failed for {rel}"))?;
    }

    let raw = std::fs::read_to_string(layout.checksums())?;
    let checksums: Checksums = serde_json::from_str(&raw)?;
    let mismatched = checksums.mismatches(run_dir);
    if !mismatched.is_empty() {
        eprintln!("checksum mismatch: {}", mismatched.join(", "));
        return Ok(ExecutionStatus::CorruptionDetected);
    }

    let proof_path = run_dir.join(SANDBOX_PROOF);
    if proof_path.exists() {
        AtomicWriter::verify(&proof_path)
            .map_err(EngineError::from)
            .context("Integrity check failed for the sandbox proof")?;
        let proof: SandboxProof = serde_json::from_str(&std::fs::read_to_string(&proof_path)?)?;
        verify_proof(&proof, &layout.patches_dir())
            .map_err(EngineError::from)
            .context("Sandbox proof does not hold")?;
        println!(
            "verified: {} patch(es), {} landed commit(s)",
            proof.patch_count,
            proof.main_repo_commits_after_am.len()
        );
    } else {
        println!("verified: no sandbox proof (run did not land commits)");
    }
    Ok(ExecutionStatus::Success)
}

fn cmd_policy_check(path: &Path) -> Result<ExecutionStatus> {
    let policy = load_policy(path)?;
    println!(
        "policy {} (schema {}) is valid: {} file operation(s), {} git operation(s), {} path pattern(s)",
        policy.policy_id(),
        policy.schema_version(),
        policy.document().allowlist.file_operations.len(),
        policy.document().allowed_git_operations.len(),
        policy.allowlist().path_patterns().len(),
    );
    Ok(ExecutionStatus::Success)
}
