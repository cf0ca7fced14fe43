//! Engine error type and its mapping onto the serializable error taxonomy.

use loomflow_types::workflow::{ErrorKind, StepError};
use thiserror::Error;

/// Errors produced anywhere in the engine.
///
/// Load-time problems (parse, validation) are fatal and abort before any
/// step runs. Runtime variants are captured per step, classified via
/// [`EngineError::kind`], and fed to retry policies and step results.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Definition malformed at the workflow level (bad name, no steps,
    /// bad input declarations).
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A specific step is malformed (duplicate IDs, cycles, bad dependency
    /// targets, nested loops).
    #[error("validation failed for step '{step_id}': {reason}")]
    Validation { step_id: String, reason: String },

    /// The caller-supplied run inputs do not satisfy the workflow's input
    /// declarations.
    #[error("invalid run input: {0}")]
    InvalidInput(String),

    /// The YAML document could not be parsed at all.
    #[error("failed to parse workflow definition: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    /// Filesystem failure while loading or saving a definition.
    #[error("workflow file IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A `${...}` reference could not be resolved.
    #[error("cannot resolve reference '{path}': {reason}")]
    Reference { path: String, reason: String },

    /// A condition expression is malformed or ill-typed.
    #[error("cannot evaluate '{expression}': {reason}")]
    Evaluation { expression: String, reason: String },

    /// A loop source would produce more iterations than allowed.
    #[error("loop source yields {actual} iterations, exceeding the limit of {limit}")]
    LoopLimitExceeded { actual: usize, limit: u32 },

    /// A step exceeded its effective timeout.
    #[error("step timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The script or AI port reported a failure.
    #[error("external execution failed: {0}")]
    External(String),

    /// The approval gate denied a side-effecting step.
    #[error("approval denied: {0}")]
    PermissionDenied(String),

    /// Fast-fail because the step's circuit breaker is open.
    #[error("circuit breaker open for step '{step_id}'")]
    CircuitOpen { step_id: String },

    /// The run was cancelled while work was in flight.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Classify this error into the serializable taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidDefinition(_)
            | EngineError::Validation { .. }
            | EngineError::InvalidInput(_)
            | EngineError::Parse(_) => ErrorKind::Validation,
            EngineError::Io(_) | EngineError::External(_) => ErrorKind::External,
            EngineError::Reference { .. } => ErrorKind::Reference,
            EngineError::Evaluation { .. } => ErrorKind::Evaluation,
            EngineError::LoopLimitExceeded { .. } => ErrorKind::LoopLimit,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Capture this error as a serializable step failure.
    pub fn to_step_error(&self) -> StepError {
        StepError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
