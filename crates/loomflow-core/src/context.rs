//! Per-run execution context: input snapshot, step outputs, skip set, and
//! loop frames.
//!
//! `ExecutionContext` is the state that flows through a workflow run. Step
//! outputs are append-only -- once recorded they are never mutated -- so a
//! clone handed to a spawned step task is a consistent read-only snapshot.
//! Size limits prevent unbounded memory growth from runaway step outputs.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all step outputs in a run (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Loop frames
// ---------------------------------------------------------------------------

/// One active loop iteration, addressable as `${loop.*}`.
///
/// Array sources populate `item` and `index`; object sources additionally
/// populate `key` (with `item` holding the entry value). `${loop.value}` is
/// an alias for `${loop.item}` in object iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopFrame {
    pub item: Value,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Execution state for a single workflow run.
///
/// The orchestrator owns the authoritative instance; spawned step tasks get
/// clones. Outputs written by tasks are merged back at join time, so the
/// outputs visible to a step were all committed before its batch started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    /// Resolved workflow inputs (caller values merged over declared defaults).
    pub inputs: BTreeMap<String, Value>,
    /// Step outputs keyed by step ID. Append-only.
    pub step_outputs: HashMap<String, Value>,
    /// Steps marked skipped by branch selection or the failure cascade.
    pub skipped: HashSet<String>,
    /// Stack of active loop frames, innermost last.
    pub loop_frames: Vec<LoopFrame>,
    /// Error captured from a failed primary, visible as `${error.*}` while
    /// the paired fallback step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_error: Option<loomflow_types::workflow::StepError>,
}

impl ExecutionContext {
    /// Create a fresh context for a run.
    pub fn new(
        run_id: Uuid,
        workflow_id: Uuid,
        workflow_name: String,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            workflow_name,
            inputs,
            step_outputs: HashMap::new(),
            skipped: HashSet::new(),
            loop_frames: Vec::new(),
            fallback_error: None,
        }
    }

    /// Record the output of a completed step.
    ///
    /// Enforces `MAX_STEP_OUTPUT_SIZE` per output (oversized outputs are
    /// replaced by a truncation marker) and `MAX_CONTEXT_SIZE` in total.
    pub fn set_step_output(&mut self, step_id: &str, output: Value) -> Result<(), EngineError> {
        let serialized = serde_json::to_string(&output)
            .map_err(|e| EngineError::External(format!("unserializable step output: {e}")))?;

        if serialized.len() > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size = serialized.len(),
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
            });
            self.step_outputs.insert(step_id.to_string(), truncated);
        } else {
            self.step_outputs.insert(step_id.to_string(), output);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(EngineError::External(format!(
                "total run context size ({total} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
            )));
        }

        Ok(())
    }

    /// Output of a completed step, if any.
    pub fn get_step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)
    }

    /// Mark a step (and its recorded reason is carried by the caller's
    /// events) as skipped.
    pub fn mark_skipped(&mut self, step_id: &str) {
        self.skipped.insert(step_id.to_string());
    }

    pub fn is_skipped(&self, step_id: &str) -> bool {
        self.skipped.contains(step_id)
    }

    /// Enter a loop iteration.
    pub fn push_loop_frame(&mut self, frame: LoopFrame) {
        self.loop_frames.push(frame);
    }

    /// Leave the innermost loop iteration.
    pub fn pop_loop_frame(&mut self) -> Option<LoopFrame> {
        self.loop_frames.pop()
    }

    /// The innermost active loop frame, if any.
    pub fn current_loop_frame(&self) -> Option<&LoopFrame> {
        self.loop_frames.last()
    }

    /// Total serialized size of all step outputs in bytes.
    pub fn total_size(&self) -> usize {
        self.step_outputs
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum()
    }
}
