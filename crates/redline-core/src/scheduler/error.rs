//! Error types for the scheduler.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The dependency graph contains a cycle; no operation was run.
    #[error("dependency cycle detected involving operations: {ops:?}")]
    Cycle { ops: Vec<String> },

    #[error("duplicate operation id: {op_id}")]
    DuplicateOperation { op_id: String },

    #[error("operation {op_id} depends on undeclared operation {dependency}")]
    UnknownDependency { op_id: String, dependency: String },

    #[error("illegal transition for {op_id}: {from} -> {to}")]
    IllegalTransition {
        op_id: String,
        from: String,
        to: String,
    },
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
