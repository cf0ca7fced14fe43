//! Event types for the Loomflow execution event stream.
//!
//! `ExecutionEvent` is the unified event type broadcast during workflow
//! execution. The visual canvas subscribes to this stream to animate runs
//! in real time. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{BranchTaken, StepError};

/// Events emitted during workflow execution.
///
/// Every variant carries the run ID and a wall-clock timestamp so
/// subscribers can order and attribute events without extra lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A workflow run has started.
    RunStarted {
        run_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
        timestamp: DateTime<Utc>,
    },

    /// A step has started executing (first attempt only).
    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_type: String,
        timestamp: DateTime<Utc>,
    },

    /// A step completed successfully.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        /// Output value produced by the step.
        output: Value,
        duration_ms: u64,
        attempts: u32,
        /// Which branch a conditional step took, when applicable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<BranchTaken>,
        timestamp: DateTime<Utc>,
    },

    /// A step failed (terminally -- retries exhausted or non-retryable).
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: StepError,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// A step was skipped by branch selection or the failure cascade.
    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The run completed with every executed step successful.
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        steps_completed: u32,
        timestamp: DateTime<Utc>,
    },

    /// The run failed or was aborted.
    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            ExecutionEvent::RunStarted { run_id, .. }
            | ExecutionEvent::StepStarted { run_id, .. }
            | ExecutionEvent::StepCompleted { run_id, .. }
            | ExecutionEvent::StepFailed { run_id, .. }
            | ExecutionEvent::StepSkipped { run_id, .. }
            | ExecutionEvent::RunCompleted { run_id, .. }
            | ExecutionEvent::RunFailed { run_id, .. } => *run_id,
        }
    }

    /// The step this event concerns, or None for run-scoped events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::StepStarted { step_id, .. }
            | ExecutionEvent::StepCompleted { step_id, .. }
            | ExecutionEvent::StepFailed { step_id, .. }
            | ExecutionEvent::StepSkipped { step_id, .. } => Some(step_id),

            ExecutionEvent::RunStarted { .. }
            | ExecutionEvent::RunCompleted { .. }
            | ExecutionEvent::RunFailed { .. } => None,
        }
    }
}
