//! Operations, their lifecycle states and the runner seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of the operation DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Operation {
    pub fn new(op_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            action: action.into(),
            params: Value::Object(Default::default()),
            depends_on: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Lifecycle: `Pending → Ready → Running → {Success | Failed | Skipped}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OpState {
    Pending,
    Ready,
    Running,
    Success,
    Failed { reason: String },
    Skipped { cause: String },
}

impl OpState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed { .. } | Self::Skipped { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// Whether `self → next` is a legal lifecycle step.
    ///
    /// `Pending → Skipped` and `Ready → Skipped` cover failure propagation
    /// and deadline expiry.
    pub fn can_transition_to(&self, next: &OpState) -> bool {
        use OpState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped { .. })
                | (Ready, Running)
                | (Ready, Skipped { .. })
                | (Running, Success)
                | (Running, Failed { .. })
        )
    }
}

impl std::fmt::Display for OpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed({reason})"),
            Self::Skipped { cause } => write!(f, "skipped({cause})"),
            other => f.write_str(other.label()),
        }
    }
}

/// What a successful operation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutput {
    /// Unified diff of the operation's effect, if it changed files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct OperationFailure {
    pub reason: String,
}

impl OperationFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Executes a single operation. Implementations must be safe to call
/// concurrently for independent operations.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    async fn run(&self, op: &Operation) -> Result<OperationOutput, OperationFailure>;
}
