//! Operation DAG scheduling.

pub mod dag;
pub mod error;
pub mod operation;

pub use dag::{
    DagScheduler, OperationRecord, RunStatus, SchedulerOptions, SchedulerReport, TIMEOUT_REASON,
};
pub use error::{SchedulerError, SchedulerResult};
pub use operation::{OpState, Operation, OperationFailure, OperationOutput, OperationRunner};
