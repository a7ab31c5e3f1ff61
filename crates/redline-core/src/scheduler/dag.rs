//! Dependency-aware operation scheduler.
//!
//! Operations form a DAG through `depends_on`. [`DagScheduler::build`]
//! rejects duplicates, dangling dependencies and cycles before anything runs.
//! [`DagScheduler::execute`] then dispatches ready operations onto at most
//! `max_concurrency` tokio tasks, recomputing readiness each time one
//! finishes. A failure skips every transitive dependent; the global deadline
//! aborts whatever is still running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::{AbortHandle, Id, JoinSet};
use tokio::time::Instant;
use tracing::{instrument, warn};

use super::error::{SchedulerError, SchedulerResult};
use super::operation::{OpState, Operation, OperationFailure, OperationOutput, OperationRunner};
use crate::audit::{event, AuditLog};
use crate::obs;

/// Reason recorded on operations still running when the deadline passes.
pub const TIMEOUT_REASON: &str = "timeout";

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on concurrently running operations. Zero is treated as one.
    pub max_concurrency: usize,
    /// Global deadline for the whole DAG, measured from `execute`.
    pub deadline: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op_id: String,
    pub action: String,
    pub state: OpState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OperationOutput>,
}

/// Final state of every operation, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerReport {
    pub status: RunStatus,
    pub timed_out: bool,
    pub records: Vec<OperationRecord>,
}

impl SchedulerReport {
    pub fn state_of(&self, op_id: &str) -> Option<&OpState> {
        self.records
            .iter()
            .find(|r| r.op_id == op_id)
            .map(|r| &r.state)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, OpState::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.ids_where(|s| matches!(s, OpState::Skipped { .. }))
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.ids_where(|s| *s == OpState::Success)
    }

    fn ids_where(&self, pred: impl Fn(&OpState) -> bool) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| pred(&r.state))
            .map(|r| r.op_id.as_str())
            .collect()
    }
}

type TaskOutcome = Result<OperationOutput, OperationFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

#[derive(Debug)]
pub struct DagScheduler {
    ops: Vec<Operation>,
    /// `deps[i]` = indices `i` waits for.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]` = indices waiting for `i`.
    dependents: Vec<Vec<usize>>,
    states: Vec<OpState>,
    outputs: Vec<Option<OperationOutput>>,
    audit: Option<Arc<AuditLog>>,
}

impl DagScheduler {
    /// Validate the graph and prepare every operation in `Pending`.
    pub fn build(operations: Vec<Operation>) -> SchedulerResult<Self> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (idx, op) in operations.iter().enumerate() {
            if index.insert(op.op_id.as_str(), idx).is_some() {
                return Err(SchedulerError::DuplicateOperation {
                    op_id: op.op_id.clone(),
                });
            }
        }

        let mut deps = vec![Vec::new(); operations.len()];
        let mut dependents = vec![Vec::new(); operations.len()];
        for (idx, op) in operations.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &op.depends_on {
                let dep_idx =
                    *index
                        .get(dep.as_str())
                        .ok_or_else(|| SchedulerError::UnknownDependency {
                            op_id: op.op_id.clone(),
                            dependency: dep.clone(),
                        })?;
                if seen.insert(dep_idx) {
                    deps[idx].push(dep_idx);
                    dependents[dep_idx].push(idx);
                }
            }
        }

        let n = operations.len();
        let scheduler = Self {
            ops: operations,
            deps,
            dependents,
            states: vec![OpState::Pending; n],
            outputs: vec![None; n],
            audit: None,
        };
        if let Some(cycle) = scheduler.find_cycle() {
            return Err(SchedulerError::Cycle { ops: cycle });
        }
        Ok(scheduler)
    }

    /// Record every state transition on `audit`.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn state(&self, op_id: &str) -> Option<&OpState> {
        self.ops
            .iter()
            .position(|op| op.op_id == op_id)
            .map(|idx| &self.states[idx])
    }

    /// `Pending` operations whose dependencies have all succeeded.
    pub fn ready_operations(&self) -> Vec<&Operation> {
        self.ready_indices().map(|idx| &self.ops[idx]).collect()
    }

    fn ready_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.ops.len()).filter(|&idx| {
            self.states[idx] == OpState::Pending
                && self.deps[idx]
                    .iter()
                    .all(|&d| self.states[d] == OpState::Success)
        })
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.ops.len()];
        let mut stack = Vec::new();
        for idx in 0..self.ops.len() {
            if marks[idx] == Mark::Unvisited {
                if let Some(cycle) = self.dfs_cycle(idx, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        idx: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[idx] = Mark::Active;
        stack.push(idx);
        for &dep in &self.deps[idx] {
            match marks[dep] {
                Mark::Active => {
                    let start = stack.iter().position(|&s| s == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|&i| self.ops[i].op_id.clone())
                        .collect();
                    cycle.push(self.ops[dep].op_id.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.dfs_cycle(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[idx] = Mark::Done;
        None
    }

    fn transition(&mut self, idx: usize, next: OpState) -> SchedulerResult<()> {
        let current = &self.states[idx];
        let op = &self.ops[idx];
        if !current.can_transition_to(&next) {
            return Err(SchedulerError::IllegalTransition {
                op_id: op.op_id.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        obs::emit_operation_transition(&op.op_id, current.label(), next.label());
        if let Some(audit) = &self.audit {
            let mut details = json!({
                "op_id": op.op_id,
                "action": op.action,
                "from": current.label(),
                "to": next.label(),
            });
            match &next {
                OpState::Failed { reason } => details["reason"] = json!(reason),
                OpState::Skipped { cause } => details["cause"] = json!(cause),
                _ => {}
            }
            if let Err(e) = audit.append(event::OPERATION_STATE, details) {
                warn!(op_id = %op.op_id, error = %e, "failed to audit operation transition");
            }
        }
        self.states[idx] = next;
        Ok(())
    }

    /// Mark `idx` failed and skip every transitive dependent.
    fn fail(&mut self, idx: usize, reason: String) -> SchedulerResult<()> {
        self.transition(idx, OpState::Failed { reason })?;
        let cause = format!("dependency {} failed", self.ops[idx].op_id);
        let mut queue: VecDeque<usize> = self.dependents[idx].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if self.states[next].is_terminal() {
                continue;
            }
            self.transition(
                next,
                OpState::Skipped {
                    cause: cause.clone(),
                },
            )?;
            queue.extend(self.dependents[next].iter().copied());
        }
        Ok(())
    }

    fn skip_unfinished(&mut self, cause: &str) -> SchedulerResult<()> {
        for idx in 0..self.ops.len() {
            if matches!(self.states[idx], OpState::Pending | OpState::Ready) {
                self.transition(
                    idx,
                    OpState::Skipped {
                        cause: cause.to_string(),
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Run the DAG to completion (or until the deadline).
    #[instrument(skip(self, runner, options), fields(operations = self.ops.len()))]
    pub async fn execute(
        mut self,
        runner: Arc<dyn OperationRunner>,
        options: SchedulerOptions,
    ) -> SchedulerResult<SchedulerReport> {
        let max_concurrency = options.max_concurrency.max(1);
        let deadline = options.deadline.map(|d| Instant::now() + d);
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        let mut running: HashMap<usize, AbortHandle> = HashMap::new();
        // Join results carry only the task id; map it back to the op.
        let mut task_ops: HashMap<Id, usize> = HashMap::new();
        let mut timed_out = false;

        loop {
            let newly_ready: Vec<usize> = self.ready_indices().collect();
            for idx in newly_ready {
                self.transition(idx, OpState::Ready)?;
            }

            while running.len() < max_concurrency {
                let Some(idx) = self.states.iter().position(|s| *s == OpState::Ready) else {
                    break;
                };
                self.transition(idx, OpState::Running)?;
                let op = self.ops[idx].clone();
                let runner = Arc::clone(&runner);
                let handle = tasks.spawn(async move { runner.run(&op).await });
                task_ops.insert(handle.id(), idx);
                running.insert(idx, handle);
            }

            if running.is_empty() {
                break;
            }

            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next_with_id()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => tasks.join_next_with_id().await,
            };
            let (id, outcome) = match joined {
                Some(Ok((id, result))) => (id, Ok(result)),
                Some(Err(join_err)) => (join_err.id(), Err(join_err)),
                None => break,
            };
            let Some(idx) = task_ops.remove(&id) else {
                warn!(task_id = %id, "joined a task the scheduler did not spawn");
                continue;
            };
            running.remove(&idx);

            match outcome {
                Ok(Ok(output)) => {
                    self.outputs[idx] = Some(output);
                    self.transition(idx, OpState::Success)?;
                }
                Ok(Err(failure)) => self.fail(idx, failure.reason)?,
                Err(join_err) => {
                    let reason = if join_err.is_panic() {
                        "operation panicked"
                    } else {
                        "operation cancelled"
                    };
                    self.fail(idx, reason.to_string())?;
                }
            }
        }

        if timed_out {
            tasks.abort_all();
            let mut expired: Vec<usize> = running.keys().copied().collect();
            expired.sort_unstable();
            for idx in expired {
                if let Some(handle) = running.remove(&idx) {
                    handle.abort();
                }
                warn!(op_id = %self.ops[idx].op_id, "operation exceeded run deadline");
                self.fail(idx, TIMEOUT_REASON.to_string())?;
            }
            self.skip_unfinished("deadline exceeded")?;
        }
        self.skip_unfinished("dependencies did not succeed")?;

        let status = if self
            .states
            .iter()
            .any(|s| matches!(s, OpState::Failed { .. }))
        {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let records = self
            .ops
            .into_iter()
            .zip(self.states)
            .zip(self.outputs)
            .map(|((op, state), output)| OperationRecord {
                op_id: op.op_id,
                action: op.action,
                state,
                output,
            })
            .collect();

        Ok(SchedulerReport {
            status,
            timed_out,
            records,
        })
    }
}
