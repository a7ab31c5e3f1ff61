//! DAG scheduler properties: cycles never run, failures never leak
//! downstream.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redline_core::{
    DagScheduler, OpState, Operation, OperationFailure, OperationOutput, OperationRunner,
    RunStatus, SchedulerError, SchedulerOptions,
};

/// Fails the listed ops, succeeds everything else, remembers what ran.
struct ScriptedRunner {
    fail: BTreeSet<String>,
    ran: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn failing(ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail: ids.iter().map(|s| s.to_string()).collect(),
            ran: Mutex::new(Vec::new()),
        })
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperationRunner for ScriptedRunner {
    async fn run(&self, op: &Operation) -> Result<OperationOutput, OperationFailure> {
        self.ran.lock().unwrap().push(op.op_id.clone());
        if self.fail.contains(&op.op_id) {
            return Err(OperationFailure::new(format!("{} scripted to fail", op.op_id)));
        }
        Ok(OperationOutput::default())
    }
}

fn op(id: &str, deps: &[&str]) -> Operation {
    Operation::new(id, "noop").after(deps.iter().copied())
}

#[test]
fn test_cycles_of_every_length_are_rejected() {
    for len in 1..6 {
        let ops: Vec<Operation> = (0..len)
            .map(|i| {
                let next = format!("op{}", (i + 1) % len);
                op(&format!("op{i}"), &[next.as_str()])
            })
            .collect();
        match DagScheduler::build(ops) {
            Err(SchedulerError::Cycle { ops }) => {
                // The reported path closes on its first member.
                assert_eq!(ops.len(), len + 1);
                assert_eq!(ops.first(), ops.last());
            }
            other => panic!("cycle of length {len} accepted: {other:?}"),
        }
    }
}

#[test]
fn test_cycle_behind_a_valid_prefix_is_still_rejected() {
    let ops = vec![
        op("root", &[]),
        op("a", &["root", "c"]),
        op("b", &["a"]),
        op("c", &["b"]),
    ];
    let err = DagScheduler::build(ops).unwrap_err();
    match err {
        SchedulerError::Cycle { ops } => {
            assert!(ops.contains(&"a".to_string()));
            assert!(!ops.contains(&"root".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failure_skips_every_transitive_dependent() {
    // root ─┬─ a ── a1 ── a2
    //       └─ b ── b1
    // a fails: a1, a2 skipped; b branch unaffected.
    let ops = vec![
        op("root", &[]),
        op("a", &["root"]),
        op("a1", &["a"]),
        op("a2", &["a1", "b"]),
        op("b", &["root"]),
        op("b1", &["b"]),
    ];
    let runner = ScriptedRunner::failing(&["a"]);
    let report = DagScheduler::build(ops)
        .unwrap()
        .execute(runner.clone(), SchedulerOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(!report.timed_out);
    assert_eq!(report.failed(), vec!["a"]);
    assert_eq!(report.skipped(), vec!["a1", "a2"]);
    assert_eq!(report.succeeded(), vec!["root", "b", "b1"]);

    let ran = runner.ran();
    assert!(!ran.contains(&"a1".to_string()));
    assert!(!ran.contains(&"a2".to_string()));
    for record in &report.records {
        assert!(record.state.is_terminal(), "{} left {}", record.op_id, record.state);
    }
}

#[tokio::test]
async fn test_serial_execution_respects_declaration_order_among_ready_ops() {
    let ops = vec![op("x", &[]), op("y", &[]), op("z", &["x", "y"])];
    let runner = ScriptedRunner::failing(&[]);
    let report = DagScheduler::build(ops)
        .unwrap()
        .execute(
            runner.clone(),
            SchedulerOptions {
                max_concurrency: 1,
                deadline: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(runner.ran(), vec!["x", "y", "z"]);
    assert_eq!(report.state_of("z"), Some(&OpState::Success));
}
