//! Workflow domain types for Loomflow.
//!
//! Defines the canonical intermediate representation for workflows: the YAML
//! documents edited on disk and the visual canvas both convert to and from
//! `WorkflowDefinition`. This module also contains execution tracking types
//! (`StepResult`, `ExecutionRecord`) and the error-kind taxonomy shared by
//! retry policies and step results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// YAML files and the visual canvas both convert to/from this struct. It is
/// immutable once loaded: a run never mutates its definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save; files without one get a fresh ID at
    /// parse time.
    #[serde(default = "default_workflow_id")]
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared workflow inputs, keyed by input name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputDecl>,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<Step>,
    /// Default error-propagation strategy for steps that do not override it.
    #[serde(default)]
    pub error_propagation: ErrorPropagation,
    /// Maximum steps executing concurrently within a batch (default 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Default per-step timeout in milliseconds (overridable per step).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// How many past runs the history store retains for this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_retention: Option<usize>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    /// Expected value type.
    #[serde(rename = "type")]
    pub input_type: InputType,
    /// Whether the caller must supply this input when no default exists.
    #[serde(default)]
    pub required: bool,
    /// Default value used when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Value type of a declared workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl InputType {
    /// Whether `value` conforms to this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// User-defined step ID (e.g. "gather-data"). Unique within a workflow.
    pub id: String,
    /// Named input expressions; values may embed `${...}` references.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    /// Step IDs this step explicitly depends on (in addition to edges
    /// implied by `${steps.<id>...}` references).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Retry policy for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Optional circuit breaker wrapping this step's executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Step-level timeout in milliseconds (overrides the workflow default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Per-step error-propagation override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_propagation: Option<ErrorPropagation>,
    /// The kind of step, with variant-specific configuration.
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Variant-specific step configuration, internally tagged by `type` to match
/// the YAML structure:
/// ```yaml
/// - id: check
///   type: script
///   script: scripts/check.ts
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Execute a sandboxed script through the script port.
    Script {
        /// Path to the script, relative to the project root.
        script: String,
    },
    /// Send a prompt to the AI provider client.
    AiCall {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Conditional branching (if/else) over other top-level steps.
    Conditional {
        /// Restricted boolean expression (see the condition evaluator).
        condition: String,
        #[serde(default)]
        then_steps: Vec<String>,
        #[serde(default)]
        else_steps: Vec<String>,
    },
    /// Iterate an embedded step list over a data source.
    Loop {
        /// Expression resolving to an array, object, or `range(start,end)`.
        source: String,
        /// Iteration cap (default 100, hard ceiling 1000).
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        /// Embedded body step definitions.
        steps: Vec<Step>,
    },
    /// Run a primary step; on failure, run the fallback step with the
    /// primary's error available as `${error.kind}` / `${error.message}`.
    Fallback {
        primary: Box<Step>,
        fallback: Box<Step>,
    },
}

impl StepKind {
    /// Short name matching the serde tag, for logging and events.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Script { .. } => "script",
            StepKind::AiCall { .. } => "ai_call",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Loop { .. } => "loop",
            StepKind::Fallback { .. } => "fallback",
        }
    }

    /// Whether this step performs side effects and must pass the approval
    /// gate before executing.
    pub fn has_side_effects(&self) -> bool {
        matches!(self, StepKind::Script { .. })
    }
}

fn default_max_iterations() -> u32 {
    100
}

fn default_workflow_id() -> Uuid {
    Uuid::now_v7()
}

/// Hard ceiling on loop iterations regardless of configuration.
pub const LOOP_ITERATION_CEILING: u32 = 1000;

// ---------------------------------------------------------------------------
// Error propagation
// ---------------------------------------------------------------------------

/// What a step failure does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPropagation {
    /// Abort the run on the first step failure.
    #[default]
    FailFast,
    /// Record the failure, skip dependents, and continue the run.
    FailSilent,
    /// Route to the paired fallback step (only meaningful on fallback steps).
    Fallback,
}

// ---------------------------------------------------------------------------
// Retry / circuit-breaker configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (default 1, i.e. no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    #[serde(default)]
    pub delay: DelayStrategy,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied per attempt under the exponential strategies.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Cap on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Error kinds that qualify for retry. `None` retries any kind that is
    /// retryable by default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<ErrorKind>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: DelayStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retry_on: None,
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayStrategy {
    /// Constant delay between attempts.
    #[default]
    Fixed,
    /// Delay multiplied by `backoff_multiplier` after each attempt.
    Exponential,
    /// Exponential growth with uniform random jitter added.
    Jittered,
}

/// Circuit breaker configuration for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before half-opening, in milliseconds.
    pub cooldown_ms: u64,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Serializable error classification used in step results and retry filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Definition malformed; fatal at load time.
    Validation,
    /// Unresolvable `${...}` reference.
    Reference,
    /// Malformed or ill-typed condition expression.
    Evaluation,
    /// Loop iteration source exceeded the configured ceiling.
    LoopLimit,
    /// Step exceeded its effective timeout.
    Timeout,
    /// Script or AI port failure.
    External,
    /// The approval gate denied the step.
    PermissionDenied,
    /// Fast-fail while the step's circuit breaker is open.
    CircuitOpen,
    /// The run was cancelled while the step was in flight.
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind qualifies for retry when no allow-list is set.
    pub fn retryable_by_default(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::External)
    }

    /// The snake_case tag used in serialized form and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Reference => "reference",
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::LoopLimit => "loop_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::External => "external",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured step failure: classification plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// Terminal status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Which branch a conditional step took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchTaken {
    Then,
    Else,
}

// ---------------------------------------------------------------------------
// Step result / execution record
// ---------------------------------------------------------------------------

/// The recorded outcome of one step execution within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step ID matching `Step.id`.
    pub step_id: String,
    pub status: StepStatus,
    /// Output value (absent for skipped and failed steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Captured failure, if the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Number of attempts made (1-based; 0 for skipped steps).
    pub attempts: u32,
    /// Which branch was taken, for conditional steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchTaken>,
    /// Zero-based iteration index, for steps run inside a loop body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
}

impl StepResult {
    /// A successful result with the given output.
    pub fn success(step_id: &str, output: Value, started_at: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            started_at,
            finished_at: Utc::now(),
            attempts,
            branch: None,
            iteration: None,
        }
    }

    /// A failed result carrying the captured error.
    pub fn failed(step_id: &str, error: StepError, started_at: DateTime<Utc>, attempts: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            started_at,
            finished_at: Utc::now(),
            attempts,
            branch: None,
            iteration: None,
        }
    }

    /// A skipped result. Skipped steps produce no output and no error.
    pub fn skipped(step_id: &str) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            started_at: now,
            finished_at: now,
            attempts: 0,
            branch: None,
            iteration: None,
        }
    }
}

/// The persisted outcome of one workflow run.
///
/// Created at run start, finalized at completion or fatal abort. The run's
/// final status and per-step breakdown are fully reconstructable from this
/// record alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// ID of the workflow definition that was executed.
    pub workflow_id: Uuid,
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Snapshot of the resolved workflow inputs.
    pub inputs: BTreeMap<String, Value>,
    /// Step results in completion order.
    pub steps: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Run-level error message, if the run failed or aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a full `WorkflowDefinition` exercising all step variants.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "nightly-report".to_string(),
            description: Some("Collect metrics, summarize, publish".to_string()),
            inputs: BTreeMap::from([
                (
                    "threshold".to_string(),
                    InputDecl {
                        input_type: InputType::Number,
                        required: false,
                        default: Some(json!(80)),
                    },
                ),
                (
                    "project".to_string(),
                    InputDecl {
                        input_type: InputType::String,
                        required: true,
                        default: None,
                    },
                ),
            ]),
            steps: vec![
                Step {
                    id: "collect".to_string(),
                    inputs: BTreeMap::from([(
                        "project".to_string(),
                        "${workflow.inputs.project}".to_string(),
                    )]),
                    depends_on: vec![],
                    retry: Some(RetryPolicy {
                        max_attempts: 3,
                        delay: DelayStrategy::Exponential,
                        ..RetryPolicy::default()
                    }),
                    circuit_breaker: Some(CircuitBreakerConfig {
                        failure_threshold: 5,
                        cooldown_ms: 10_000,
                    }),
                    timeout_ms: Some(30_000),
                    error_propagation: None,
                    kind: StepKind::Script {
                        script: "scripts/collect.ts".to_string(),
                    },
                },
                Step {
                    id: "summarize".to_string(),
                    inputs: BTreeMap::new(),
                    depends_on: vec!["collect".to_string()],
                    retry: None,
                    circuit_breaker: None,
                    timeout_ms: None,
                    error_propagation: None,
                    kind: StepKind::AiCall {
                        prompt: "Summarize: ${steps.collect.outputs}".to_string(),
                        model: Some("default".to_string()),
                    },
                },
                Step {
                    id: "gate".to_string(),
                    inputs: BTreeMap::new(),
                    depends_on: vec![],
                    retry: None,
                    circuit_breaker: None,
                    timeout_ms: None,
                    error_propagation: None,
                    kind: StepKind::Conditional {
                        condition: "${steps.collect.outputs.score} > 80".to_string(),
                        then_steps: vec!["publish".to_string()],
                        else_steps: vec!["notify-low".to_string()],
                    },
                },
                Step {
                    id: "publish".to_string(),
                    inputs: BTreeMap::new(),
                    depends_on: vec![],
                    retry: None,
                    circuit_breaker: None,
                    timeout_ms: None,
                    error_propagation: None,
                    kind: StepKind::Script {
                        script: "scripts/publish.ts".to_string(),
                    },
                },
                Step {
                    id: "notify-low".to_string(),
                    inputs: BTreeMap::new(),
                    depends_on: vec![],
                    retry: None,
                    circuit_breaker: None,
                    timeout_ms: None,
                    error_propagation: None,
                    kind: StepKind::AiCall {
                        prompt: "Explain the low score".to_string(),
                        model: None,
                    },
                },
                Step {
                    id: "per-item".to_string(),
                    inputs: BTreeMap::new(),
                    depends_on: vec!["collect".to_string()],
                    retry: None,
                    circuit_breaker: None,
                    timeout_ms: None,
                    error_propagation: Some(ErrorPropagation::FailSilent),
                    kind: StepKind::Loop {
                        source: "${steps.collect.outputs.items}".to_string(),
                        max_iterations: 50,
                        steps: vec![Step {
                            id: "per-item-body".to_string(),
                            inputs: BTreeMap::from([(
                                "item".to_string(),
                                "${loop.item}".to_string(),
                            )]),
                            depends_on: vec![],
                            retry: None,
                            circuit_breaker: None,
                            timeout_ms: None,
                            error_propagation: None,
                            kind: StepKind::Script {
                                script: "scripts/per-item.ts".to_string(),
                            },
                        }],
                    },
                },
                Step {
                    id: "robust-send".to_string(),
                    inputs: BTreeMap::new(),
                    depends_on: vec![],
                    retry: None,
                    circuit_breaker: None,
                    timeout_ms: None,
                    error_propagation: None,
                    kind: StepKind::Fallback {
                        primary: Box::new(Step {
                            id: "send-primary".to_string(),
                            inputs: BTreeMap::new(),
                            depends_on: vec![],
                            retry: None,
                            circuit_breaker: None,
                            timeout_ms: None,
                            error_propagation: None,
                            kind: StepKind::Script {
                                script: "scripts/send.ts".to_string(),
                            },
                        }),
                        fallback: Box::new(Step {
                            id: "send-backup".to_string(),
                            inputs: BTreeMap::from([(
                                "reason".to_string(),
                                "${error.message}".to_string(),
                            )]),
                            depends_on: vec![],
                            retry: None,
                            circuit_breaker: None,
                            timeout_ms: None,
                            error_propagation: None,
                            kind: StepKind::Script {
                                script: "scripts/send-backup.ts".to_string(),
                            },
                        }),
                    },
                },
            ],
            error_propagation: ErrorPropagation::FailFast,
            concurrency: Some(4),
            timeout_ms: Some(60_000),
            history_retention: Some(5),
        }
    }

    // -----------------------------------------------------------------------
    // YAML roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_workflow_definition_yaml_roundtrip() {
        let original = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&original).expect("serialize to YAML");

        assert!(yaml.contains("nightly-report"));
        assert!(yaml.contains("type: script"));
        assert!(yaml.contains("type: ai_call"));
        assert!(yaml.contains("type: conditional"));
        assert!(yaml.contains("type: loop"));
        assert!(yaml.contains("type: fallback"));

        let parsed: WorkflowDefinition =
            serde_yaml_ng::from_str(&yaml).expect("deserialize from YAML");
        assert_eq!(parsed.name, "nightly-report");
        assert_eq!(parsed.steps.len(), 7);
        assert_eq!(parsed.inputs.len(), 2);
        assert_eq!(parsed.concurrency, Some(4));
    }

    #[test]
    fn test_workflow_definition_json_roundtrip() {
        let original = sample_workflow();
        let json_str = serde_json::to_string_pretty(&original).expect("serialize to JSON");
        let parsed: WorkflowDefinition =
            serde_json::from_str(&json_str).expect("deserialize from JSON");
        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.steps.len(), original.steps.len());
    }

    // -----------------------------------------------------------------------
    // StepKind variants
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_kind_script_serde() {
        let step = Step {
            id: "run".to_string(),
            inputs: BTreeMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            timeout_ms: None,
            error_propagation: None,
            kind: StepKind::Script {
                script: "scripts/run.ts".to_string(),
            },
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"type\":\"script\""));
        let parsed: Step = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed.kind, StepKind::Script { .. }));
    }

    #[test]
    fn test_step_kind_conditional_serde() {
        let json = r#"{
            "id": "gate",
            "type": "conditional",
            "condition": "${steps.check.outputs.score} > 80",
            "then_steps": ["a"],
            "else_steps": ["b"]
        }"#;
        let parsed: Step = serde_json::from_str(json).unwrap();
        match &parsed.kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                assert_eq!(then_steps, &vec!["a".to_string()]);
                assert_eq!(else_steps, &vec!["b".to_string()]);
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn test_step_kind_loop_default_max_iterations() {
        let yaml = r#"
id: each
type: loop
source: "${workflow.inputs.items}"
steps:
  - id: body
    type: script
    script: scripts/body.ts
"#;
        let parsed: Step = serde_yaml_ng::from_str(yaml).unwrap();
        match parsed.kind {
            StepKind::Loop { max_iterations, .. } => assert_eq!(max_iterations, 100),
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn test_step_kind_type_names() {
        let kinds = [
            (
                StepKind::Script {
                    script: "s".to_string(),
                },
                "script",
                true,
            ),
            (
                StepKind::AiCall {
                    prompt: "p".to_string(),
                    model: None,
                },
                "ai_call",
                false,
            ),
        ];
        for (kind, name, side_effects) in kinds {
            assert_eq!(kind.type_name(), name);
            assert_eq!(kind.has_side_effects(), side_effects);
        }
    }

    // -----------------------------------------------------------------------
    // Retry policy defaults
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_policy_defaults() {
        let policy: RetryPolicy = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, DelayStrategy::Fixed);
        assert_eq!(policy.initial_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert!(policy.retry_on.is_none());
    }

    #[test]
    fn test_retry_policy_allow_list() {
        let yaml = r#"
max_attempts: 3
delay: jittered
retry_on: [timeout]
"#;
        let policy: RetryPolicy = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, DelayStrategy::Jittered);
        assert_eq!(policy.retry_on, Some(vec![ErrorKind::Timeout]));
    }

    // -----------------------------------------------------------------------
    // Error kinds
    // -----------------------------------------------------------------------

    #[test]
    fn test_error_kind_retryable_defaults() {
        assert!(ErrorKind::Timeout.retryable_by_default());
        assert!(ErrorKind::External.retryable_by_default());
        assert!(!ErrorKind::PermissionDenied.retryable_by_default());
        assert!(!ErrorKind::Validation.retryable_by_default());
        assert!(!ErrorKind::CircuitOpen.retryable_by_default());
        assert!(!ErrorKind::Cancelled.retryable_by_default());
    }

    #[test]
    fn test_error_kind_serde() {
        for (kind, tag) in [
            (ErrorKind::Validation, "\"validation\""),
            (ErrorKind::Reference, "\"reference\""),
            (ErrorKind::Evaluation, "\"evaluation\""),
            (ErrorKind::LoopLimit, "\"loop_limit\""),
            (ErrorKind::Timeout, "\"timeout\""),
            (ErrorKind::External, "\"external\""),
            (ErrorKind::PermissionDenied, "\"permission_denied\""),
            (ErrorKind::CircuitOpen, "\"circuit_open\""),
            (ErrorKind::Cancelled, "\"cancelled\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), tag);
        }
    }

    // -----------------------------------------------------------------------
    // Error propagation
    // -----------------------------------------------------------------------

    #[test]
    fn test_error_propagation_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ErrorPropagation::FailFast).unwrap(),
            "\"fail-fast\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorPropagation::FailSilent).unwrap(),
            "\"fail-silent\""
        );
        assert_eq!(ErrorPropagation::default(), ErrorPropagation::FailFast);
    }

    // -----------------------------------------------------------------------
    // Step results
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_result_constructors() {
        let ok = StepResult::success("a", json!(1), Utc::now(), 2);
        assert_eq!(ok.status, StepStatus::Success);
        assert_eq!(ok.output, Some(json!(1)));
        assert_eq!(ok.attempts, 2);

        let failed = StepResult::failed(
            "b",
            StepError {
                kind: ErrorKind::Timeout,
                message: "step timed out".to_string(),
            },
            Utc::now(),
            3,
        );
        assert_eq!(failed.status, StepStatus::Failed);
        assert!(failed.output.is_none());
        assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::Timeout);

        let skipped = StepResult::skipped("c");
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(skipped.output.is_none());
        assert!(skipped.error.is_none());
        assert_eq!(skipped.attempts, 0);
    }

    #[test]
    fn test_execution_record_json_roundtrip() {
        let record = ExecutionRecord {
            workflow_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            status: RunStatus::Succeeded,
            inputs: BTreeMap::from([("x".to_string(), json!(1))]),
            steps: vec![StepResult::success("a", json!("done"), Utc::now(), 1)],
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            duration_ms: 42,
            error: None,
        };
        let json_str = serde_json::to_string(&record).unwrap();
        let parsed: ExecutionRecord = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed.status, RunStatus::Succeeded);
        assert_eq!(parsed.steps.len(), 1);
        assert_eq!(parsed.duration_ms, 42);
    }

    #[test]
    fn test_input_type_matches() {
        assert!(InputType::Number.matches(&json!(3)));
        assert!(!InputType::Number.matches(&json!("3")));
        assert!(InputType::Array.matches(&json!([1, 2])));
        assert!(InputType::Object.matches(&json!({"a": 1})));
        assert!(InputType::Boolean.matches(&json!(true)));
        assert!(InputType::String.matches(&json!("s")));
    }

    // -----------------------------------------------------------------------
    // YAML from-scratch parse (realistic workflow YAML)
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_realistic_yaml_workflow() {
        let yaml = r#"
id: "01938e90-0000-7000-8000-000000000001"
name: score-pipeline
inputs:
  x:
    type: number
    required: true
steps:
  - id: check
    type: script
    script: scripts/check.ts
    inputs:
      value: "${workflow.inputs.x}"
  - id: gate
    type: conditional
    condition: "${steps.check.outputs.score} > 80"
    then_steps: [celebrate]
    else_steps: [investigate]
  - id: celebrate
    type: ai_call
    prompt: "Write a short celebration"
  - id: investigate
    type: ai_call
    prompt: "Explain what went wrong"
    retry:
      max_attempts: 2
      delay: exponential
"#;
        let wf: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(wf.name, "score-pipeline");
        assert_eq!(wf.steps.len(), 4);
        assert_eq!(wf.error_propagation, ErrorPropagation::FailFast);
        assert!(wf.inputs["x"].required);
        let retry = wf.steps[3].retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.delay, DelayStrategy::Exponential);
    }
}
