//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition` IR,
//! validates structural constraints (unique IDs, dependency targets, branch
//! membership, loop nesting, condition syntax), and discovers workflow
//! files on disk. A definition that passes [`validate_definition`] will not
//! produce validation errors at run time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use loomflow_types::workflow::{LOOP_ITERATION_CEILING, Step, StepKind, WorkflowDefinition};

use crate::condition;
use crate::dag;
use crate::error::EngineError;
use crate::resolver;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, EngineError> {
    let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, EngineError> {
    Ok(serde_yaml_ng::to_string(def)?)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty, alphanumeric and hyphens only
/// - At least one step exists
/// - Step IDs are unique across the whole definition, including loop bodies
///   and fallback children
/// - All `depends_on` targets exist
/// - Branch lists name existing steps; no step is claimed by two branches
/// - Loop bodies are non-empty and contain no nested loops
/// - Fallback children are script or AI steps
/// - Condition expressions tokenize
/// - Input defaults match their declared types
/// - The dependency graph (explicit + reference edges) is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), EngineError> {
    let workflow_error = |reason: String| EngineError::InvalidDefinition(reason);

    if def.name.is_empty() {
        return Err(workflow_error("workflow name must not be empty".to_string()));
    }
    if !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(workflow_error(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(workflow_error(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Input defaults must match their declared types.
    for (name, decl) in &def.inputs {
        if let Some(default) = &decl.default {
            if !decl.input_type.matches(default) {
                return Err(workflow_error(format!(
                    "default for input '{name}' does not match its declared type"
                )));
            }
        }
    }

    // Step IDs must be unique across every nesting level: outputs are
    // addressed by ID alone, so collisions would be ambiguous.
    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        check_ids_unique(step, &mut seen_ids)?;
    }

    for step in &def.steps {
        validate_step(step, true)?;
    }

    // Every `${workflow.inputs.*}` reference must name a declared input.
    for step in &def.steps {
        let mut expressions = Vec::new();
        collect_expressions(step, &mut expressions);
        for expr in expressions {
            for path in resolver::find_references(expr) {
                let mut segments = path.split('.');
                if segments.next() == Some("workflow") && segments.next() == Some("inputs") {
                    match segments.next() {
                        Some(name) if def.inputs.contains_key(name) => {}
                        Some(name) => {
                            return Err(EngineError::Validation {
                                step_id: step.id.clone(),
                                reason: format!("references undeclared input '{name}'"),
                            });
                        }
                        None => {
                            return Err(EngineError::Validation {
                                step_id: step.id.clone(),
                                reason: format!("incomplete input reference '${{{path}}}'"),
                            });
                        }
                    }
                }
            }
        }
    }

    // Branch members run inline when their conditional takes a branch, so
    // they must be directly runnable: no conditionals or loops.
    for step in &def.steps {
        if let StepKind::Conditional {
            then_steps,
            else_steps,
            ..
        } = &step.kind
        {
            for member_id in then_steps.iter().chain(else_steps) {
                if let Some(member) = def.steps.iter().find(|s| &s.id == member_id) {
                    if matches!(
                        member.kind,
                        StepKind::Conditional { .. } | StepKind::Loop { .. }
                    ) {
                        return Err(EngineError::Validation {
                            step_id: member.id.clone(),
                            reason: format!(
                                "branch members must be script, ai_call, or fallback steps, found '{}'",
                                member.kind.type_name()
                            ),
                        });
                    }
                }
            }
        }
    }

    // Branch membership, dependency targets, and cycles: building the plan
    // checks all three.
    dag::build_execution_plan(&def.steps)?;

    if let Some(c) = def.concurrency {
        if c < 1 {
            return Err(workflow_error("concurrency must be >= 1".to_string()));
        }
    }
    if let Some(t) = def.timeout_ms {
        if t == 0 {
            return Err(workflow_error("timeout must be > 0".to_string()));
        }
    }

    Ok(())
}

fn check_ids_unique<'a>(step: &'a Step, seen: &mut HashSet<&'a str>) -> Result<(), EngineError> {
    if !seen.insert(step.id.as_str()) {
        return Err(EngineError::Validation {
            step_id: step.id.clone(),
            reason: "duplicate step ID".to_string(),
        });
    }
    match &step.kind {
        StepKind::Loop { steps, .. } => {
            for body in steps {
                check_ids_unique(body, seen)?;
            }
        }
        StepKind::Fallback { primary, fallback } => {
            check_ids_unique(primary, seen)?;
            check_ids_unique(fallback, seen)?;
        }
        _ => {}
    }
    Ok(())
}

/// Every expression string in a step (and its embedded children) that can
/// carry `${...}` references.
fn collect_expressions<'a>(step: &'a Step, out: &mut Vec<&'a str>) {
    out.extend(step.inputs.values().map(|s| s.as_str()));
    match &step.kind {
        StepKind::Script { script } => out.push(script),
        StepKind::AiCall { prompt, .. } => out.push(prompt),
        StepKind::Conditional { condition, .. } => out.push(condition),
        StepKind::Loop { source, steps, .. } => {
            out.push(source);
            for body in steps {
                collect_expressions(body, out);
            }
        }
        StepKind::Fallback { primary, fallback } => {
            collect_expressions(primary, out);
            collect_expressions(fallback, out);
        }
    }
}

/// Per-step checks. `top_level` is false inside loop bodies and fallback
/// children.
fn validate_step(step: &Step, top_level: bool) -> Result<(), EngineError> {
    let step_error = |reason: String| EngineError::Validation {
        step_id: step.id.clone(),
        reason,
    };

    if step.id.is_empty() {
        return Err(step_error("step ID must not be empty".to_string()));
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            return Err(step_error("retry max_attempts must be >= 1".to_string()));
        }
    }
    if let Some(breaker) = &step.circuit_breaker {
        if breaker.failure_threshold == 0 {
            return Err(step_error(
                "circuit breaker failure_threshold must be >= 1".to_string(),
            ));
        }
    }
    if step.timeout_ms == Some(0) {
        return Err(step_error("timeout must be > 0".to_string()));
    }

    match &step.kind {
        StepKind::Conditional { condition, .. } => {
            condition::check_syntax(condition).map_err(|e| step_error(e.to_string()))?;
        }
        StepKind::Loop {
            steps,
            max_iterations,
            ..
        } => {
            if !top_level {
                return Err(step_error(
                    "nested loops are not supported".to_string(),
                ));
            }
            if steps.is_empty() {
                return Err(step_error("loop body must have at least one step".to_string()));
            }
            if *max_iterations == 0 {
                return Err(step_error("max_iterations must be >= 1".to_string()));
            }
            if *max_iterations > LOOP_ITERATION_CEILING {
                return Err(step_error(format!(
                    "max_iterations must be <= {LOOP_ITERATION_CEILING}"
                )));
            }
            for body in steps {
                // Loop bodies cannot hold structural steps: no nested loops,
                // conditionals, or fallbacks inside an iteration.
                if matches!(body.kind, StepKind::Conditional { .. } | StepKind::Fallback { .. }) {
                    return Err(EngineError::Validation {
                        step_id: body.id.clone(),
                        reason: format!(
                            "loop bodies only allow script and ai_call steps, found '{}'",
                            body.kind.type_name()
                        ),
                    });
                }
                validate_step(body, false)?;
            }
        }
        StepKind::Fallback { primary, fallback } => {
            for child in [primary.as_ref(), fallback.as_ref()] {
                if !matches!(child.kind, StepKind::Script { .. } | StepKind::AiCall { .. }) {
                    return Err(EngineError::Validation {
                        step_id: child.id.clone(),
                        reason: format!(
                            "fallback pairs only allow script and ai_call steps, found '{}'",
                            child.kind.type_name()
                        ),
                    });
                }
                validate_step(child, false)?;
            }
        }
        StepKind::Script { script } => {
            if script.is_empty() {
                return Err(step_error("script path must not be empty".to_string()));
            }
        }
        StepKind::AiCall { prompt, .. } => {
            if prompt.is_empty() {
                return Err(step_error("prompt must not be empty".to_string()));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, EngineError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans `.yaml` and `.yml` files recursively. Files that fail to parse or
/// validate are skipped with a warning -- they may not be workflows at all.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, EngineError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), EngineError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(_) => {
                        tracing::warn!(?path, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loomflow_types::workflow::{ErrorPropagation, InputDecl, InputType, RetryPolicy};
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    /// Helper: build a minimal valid workflow definition.
    fn minimal_workflow(name: &str, steps: Vec<Step>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: None,
            inputs: BTreeMap::new(),
            steps,
            error_propagation: ErrorPropagation::FailFast,
            concurrency: None,
            timeout_ms: None,
            history_retention: None,
        }
    }

    fn script_step(id: &str, depends_on: Vec<&str>) -> Step {
        Step {
            id: id.to_string(),
            inputs: BTreeMap::new(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            retry: None,
            circuit_breaker: None,
            timeout_ms: None,
            error_propagation: None,
            kind: StepKind::Script {
                script: format!("scripts/{id}.ts"),
            },
        }
    }

    fn loop_step(id: &str, source: &str, body: Vec<Step>) -> Step {
        Step {
            id: id.to_string(),
            inputs: BTreeMap::new(),
            depends_on: vec![],
            retry: None,
            circuit_breaker: None,
            timeout_ms: None,
            error_propagation: None,
            kind: StepKind::Loop {
                source: source.to_string(),
                max_iterations: 100,
                steps: body,
            },
        }
    }

    // -----------------------------------------------------------------------
    // YAML roundtrip
    // -----------------------------------------------------------------------

    #[test]
    fn test_parse_yaml_roundtrip() {
        let yaml = r#"
name: daily-digest
description: Gather data and summarize
inputs:
  topic:
    type: string
    required: true
steps:
  - id: gather
    type: script
    script: scripts/gather.ts
    inputs:
      topic: "${workflow.inputs.topic}"
    timeout_ms: 120000
  - id: summarize
    type: ai_call
    prompt: "Summarize: ${steps.gather.outputs}"
    depends_on: [gather]
"#;
        let def = parse_workflow_yaml(yaml).expect("should parse");
        assert_eq!(def.name, "daily-digest");
        assert_eq!(def.steps.len(), 2);

        // Serialize back to YAML and re-parse
        let yaml2 = serialize_workflow_yaml(&def).expect("should serialize");
        let def2 = parse_workflow_yaml(&yaml2).expect("should re-parse");
        assert_eq!(def2.name, def.name);
        assert_eq!(def2.id, def.id);
        assert_eq!(def2.steps.len(), def.steps.len());
    }

    #[test]
    fn test_parse_assigns_id_when_missing() {
        let yaml = r#"
name: no-id
steps:
  - id: only
    type: script
    script: scripts/only.ts
"#;
        let def = parse_workflow_yaml(yaml).unwrap();
        assert!(!def.id.is_nil());
    }

    // -----------------------------------------------------------------------
    // Structural validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_rejects_duplicate_step_ids() {
        let def = minimal_workflow("wf", vec![script_step("a", vec![]), script_step("a", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_rejects_duplicate_id_inside_loop_body() {
        let def = minimal_workflow(
            "wf",
            vec![
                script_step("collect", vec![]),
                loop_step(
                    "each",
                    "${steps.collect.outputs}",
                    vec![script_step("collect", vec![])],
                ),
            ],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step ID"));
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let def = minimal_workflow("wf", vec![script_step("a", vec!["nonexistent"])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn test_rejects_empty_workflow() {
        let def = minimal_workflow("wf", vec![]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_rejects_invalid_name() {
        let def = minimal_workflow("has spaces!", vec![script_step("a", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn test_rejects_empty_name() {
        let def = minimal_workflow("", vec![script_step("a", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_rejects_cycle() {
        let def = minimal_workflow(
            "wf",
            vec![script_step("a", vec!["b"]), script_step("b", vec!["a"])],
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut def = minimal_workflow("wf", vec![script_step("a", vec![])]);
        def.timeout_ms = Some(0);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("timeout must be > 0"));
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let mut def = minimal_workflow("wf", vec![script_step("a", vec![])]);
        def.steps[0].retry = Some(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_rejects_mismatched_input_default() {
        let mut def = minimal_workflow("wf", vec![script_step("a", vec![])]);
        def.inputs.insert(
            "count".to_string(),
            InputDecl {
                input_type: InputType::Number,
                required: false,
                default: Some(json!("not-a-number")),
            },
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_rejects_undeclared_input_reference() {
        let mut def = minimal_workflow("wf", vec![script_step("a", vec![])]);
        def.steps[0].inputs.insert(
            "topic".to_string(),
            "${workflow.inputs.topic}".to_string(),
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("undeclared input 'topic'"));
    }

    #[test]
    fn test_accepts_declared_input_reference() {
        let mut def = minimal_workflow("wf", vec![script_step("a", vec![])]);
        def.inputs.insert(
            "topic".to_string(),
            InputDecl {
                input_type: InputType::String,
                required: true,
                default: None,
            },
        );
        def.steps[0].inputs.insert(
            "topic".to_string(),
            "${workflow.inputs.topic}".to_string(),
        );
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_rejects_max_iterations_above_ceiling() {
        let mut def = minimal_workflow(
            "wf",
            vec![loop_step("each", "range(0, 3)", vec![script_step("b", vec![])])],
        );
        if let StepKind::Loop { max_iterations, .. } = &mut def.steps[0].kind {
            *max_iterations = 5000;
        }
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));
    }

    // -----------------------------------------------------------------------
    // Structural steps
    // -----------------------------------------------------------------------

    #[test]
    fn test_rejects_nested_loop() {
        let inner = loop_step("inner", "range(0, 3)", vec![script_step("deep", vec![])]);
        let def = minimal_workflow("wf", vec![loop_step("outer", "range(0, 3)", vec![inner])]);
        let err = validate_definition(&def).unwrap_err();
        // Loop bodies reject structural steps before nesting even comes up.
        assert!(err.to_string().contains("loop"));
    }

    #[test]
    fn test_rejects_empty_loop_body() {
        let def = minimal_workflow("wf", vec![loop_step("each", "range(0, 3)", vec![])]);
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_rejects_malformed_condition_at_load_time() {
        let mut def = minimal_workflow("wf", vec![script_step("gate", vec![])]);
        def.steps[0].kind = StepKind::Conditional {
            condition: "(1 > 2) && true".to_string(),
            then_steps: vec![],
            else_steps: vec![],
        };
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("parentheses"));
    }

    #[test]
    fn test_rejects_conditional_inside_fallback() {
        let mut def = minimal_workflow("wf", vec![script_step("robust", vec![])]);
        def.steps[0].kind = StepKind::Fallback {
            primary: Box::new(Step {
                kind: StepKind::Conditional {
                    condition: "true".to_string(),
                    then_steps: vec![],
                    else_steps: vec![],
                },
                ..script_step("bad-primary", vec![])
            }),
            fallback: Box::new(script_step("backup", vec![])),
        };
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("fallback pairs"));
    }

    #[test]
    fn test_valid_conditional_workflow_passes() {
        let yaml = r#"
name: score-gate
steps:
  - id: check
    type: script
    script: scripts/check.ts
  - id: gate
    type: conditional
    condition: "${steps.check.outputs.score} > 80"
    then_steps: [celebrate]
    else_steps: [investigate]
  - id: celebrate
    type: ai_call
    prompt: "Celebrate"
  - id: investigate
    type: ai_call
    prompt: "Investigate"
"#;
        assert!(parse_workflow_yaml(yaml).is_ok());
    }

    // -----------------------------------------------------------------------
    // Filesystem
    // -----------------------------------------------------------------------

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/test.yaml");

        let def = minimal_workflow("test-wf", vec![script_step("a", vec![])]);
        save_workflow_file(&path, &def).expect("should save");

        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded.name, "test-wf");
        assert_eq!(loaded.id, def.id);
        assert_eq!(loaded.steps.len(), 1);
    }

    #[test]
    fn test_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();

        let wf1 = minimal_workflow("wf-one", vec![script_step("a", vec![])]);
        let wf2 = minimal_workflow("wf-two", vec![script_step("b", vec![])]);

        save_workflow_file(&dir.path().join("wf1.yaml"), &wf1).unwrap();
        save_workflow_file(&dir.path().join("sub/wf2.yml"), &wf2).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2, "should find exactly 2 valid workflows");
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let result = discover_workflows(Path::new("/nonexistent/path"));
        assert!(result.unwrap().is_empty());
    }
}
