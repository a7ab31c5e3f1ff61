//! Structured observability hooks for run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span (`run_span`)
//! - Emission functions for lifecycle events: start, finish, lock contention,
//!   policy denial, red-line evaluation and operation state changes
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).

use tracing::{debug, info, warn};

/// Run-scoped span. Attach it to the run future with
/// `tracing::Instrument` so every event inside carries `run_id`.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("redline.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, execution_request_id: &str, repo_id: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        execution_request_id = %execution_request_id,
        repo_id = %repo_id,
    );
}

/// Emit event: run finished with its status code and wall time.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_run_failed(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, error = %error);
}

pub fn emit_lock_contention(repo_id: &str, holder: Option<&str>) {
    warn!(
        event = "lock.contention",
        repo_id = %repo_id,
        holder = holder.unwrap_or("unknown"),
    );
}

pub fn emit_policy_denied(operation: &str, reason: &str) {
    warn!(event = "policy.denied", operation = %operation, reason = %reason);
}

pub fn emit_red_line_evaluated(valid: bool, violations: usize) {
    info!(
        event = "red_line.evaluated",
        valid = valid,
        violations = violations,
    );
}

pub fn emit_operation_transition(op_id: &str, from: &str, to: &str) {
    debug!(event = "operation.state", op_id = %op_id, from = %from, to = %to);
}

pub fn emit_audit_appended(event_type: &str, seq: u64) {
    debug!(event = "audit.appended", kind = %event_type, seq = seq);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _entered = run_span("test-run-id").entered();
        emit_operation_transition("op", "pending", "ready");
    }
}
