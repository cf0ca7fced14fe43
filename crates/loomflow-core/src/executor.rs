//! The workflow engine: orchestrates a run from validated definition to
//! persisted execution record.
//!
//! Execution walks the plan's batches in order. Script, AI, and fallback
//! steps within a batch run concurrently through the [`BatchScheduler`];
//! conditionals and loops are orchestration and run inline, since they
//! mutate run state (branch selection, loop frames). Each leaf execution
//! carries its own retry loop, circuit breaker, approval gate, and timeout.
//!
//! The engine is generic over the script sandbox, AI provider, and approval
//! ports, so tests drive it entirely with in-memory doubles.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use loomflow_types::event::ExecutionEvent;
use loomflow_types::workflow::{
    BranchTaken, ErrorKind, ErrorPropagation, ExecutionRecord, RunStatus, Step, StepError,
    StepKind, StepResult, StepStatus, WorkflowDefinition,
};

use crate::condition;
use crate::context::ExecutionContext;
use crate::dag::{self, ExecutionPlan};
use crate::definition;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::history::HistoryStore;
use crate::loops;
use crate::ports::{AiPort, ApprovalPort, ScriptPort};
use crate::resolver;
use crate::retry::{self, BreakerDecision, CircuitBreaker};
use crate::scheduler::{BatchScheduler, DEFAULT_CONCURRENCY};

/// Per-step timeout applied when neither the step nor the workflow sets one
/// (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 300_000;

// ---------------------------------------------------------------------------
// Public interface
// ---------------------------------------------------------------------------

/// Executes workflow definitions.
pub trait WorkflowRunner: Send + Sync {
    /// Run a workflow to completion and return its execution record.
    ///
    /// Step failures are captured in the record, not surfaced as `Err`; an
    /// `Err` means the run could not start (invalid definition or inputs).
    fn execute(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<ExecutionRecord, EngineError>> + Send;

    /// Request cancellation of an in-flight run. Returns `false` if the run
    /// is not active.
    fn cancel(&self, run_id: Uuid) -> bool;
}

/// Engine-level construction settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// Default number of past runs retained per workflow, overridable by
    /// `WorkflowDefinition::history_retention`.
    pub history_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            history_retention: crate::history::DEFAULT_RETENTION,
        }
    }
}

/// The workflow engine, generic over its external ports.
pub struct WorkflowEngine<S, A, P> {
    scripts: Arc<S>,
    ai: Arc<A>,
    approvals: Arc<P>,
    events: EventBus,
    history: Arc<HistoryStore>,
    /// Circuit breakers keyed by step ID, shared across runs in-process.
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    /// Cancellation tokens for in-flight runs.
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl<S, A, P> WorkflowEngine<S, A, P>
where
    S: ScriptPort + 'static,
    A: AiPort + 'static,
    P: ApprovalPort + 'static,
{
    pub fn new(scripts: S, ai: A, approvals: P) -> Self {
        Self::with_config(scripts, ai, approvals, EngineConfig::default())
    }

    pub fn with_config(scripts: S, ai: A, approvals: P, config: EngineConfig) -> Self {
        Self::with_parts(
            Arc::new(scripts),
            Arc::new(ai),
            Arc::new(approvals),
            EventBus::new(config.event_capacity),
            Arc::new(HistoryStore::new(config.history_retention)),
        )
    }

    /// Assemble an engine from shared parts, for callers that keep handles
    /// to the ports, bus, or history alongside the engine.
    pub fn with_parts(
        scripts: Arc<S>,
        ai: Arc<A>,
        approvals: Arc<P>,
        events: EventBus,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            scripts,
            ai,
            approvals,
            events,
            history,
            breakers: Arc::new(DashMap::new()),
            cancellations: DashMap::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Subscribe to the execution event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Run a workflow to completion.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ExecutionRecord, EngineError> {
        definition::validate_definition(def)?;
        let inputs = resolve_run_inputs(def, inputs)?;
        let plan = dag::build_execution_plan(&def.steps)?;

        let run_id = Uuid::now_v7();
        let token = CancellationToken::new();
        self.cancellations.insert(run_id, token.clone());

        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        tracing::info!(run_id = %run_id, workflow = %def.name, "workflow run started");
        self.events.publish(ExecutionEvent::RunStarted {
            run_id,
            workflow_id: def.id,
            workflow_name: def.name.clone(),
            timestamp: started_at,
        });

        let env = LeafEnv {
            scripts: Arc::clone(&self.scripts),
            ai: Arc::clone(&self.ai),
            approvals: Arc::clone(&self.approvals),
            breakers: Arc::clone(&self.breakers),
            default_timeout_ms: def.timeout_ms,
            token: token.clone(),
        };

        let mut ctx = ExecutionContext::new(run_id, def.id, def.name.clone(), inputs.clone());
        let mut results: Vec<StepResult> = Vec::new();

        let outcome = self
            .run_batches(def, &plan, &env, &mut ctx, &mut results)
            .await;

        self.cancellations.remove(&run_id);
        let finished_at = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(abort) => (abort.status, Some(abort.error)),
        };

        match status {
            RunStatus::Succeeded => {
                let steps_completed = results
                    .iter()
                    .filter(|r| r.status == StepStatus::Success)
                    .count() as u32;
                tracing::info!(run_id = %run_id, duration_ms, steps_completed, "workflow run completed");
                self.events.publish(ExecutionEvent::RunCompleted {
                    run_id,
                    workflow_name: def.name.clone(),
                    duration_ms,
                    steps_completed,
                    timestamp: finished_at,
                });
            }
            _ => {
                let message = error.clone().unwrap_or_default();
                tracing::warn!(run_id = %run_id, error = %message, "workflow run failed");
                self.events.publish(ExecutionEvent::RunFailed {
                    run_id,
                    workflow_name: def.name.clone(),
                    error: message,
                    timestamp: finished_at,
                });
            }
        }

        let record = ExecutionRecord {
            workflow_id: def.id,
            run_id,
            status,
            inputs,
            steps: results,
            started_at,
            finished_at: Some(finished_at),
            duration_ms,
            error,
        };
        self.history.record(record.clone(), def.history_retention);
        Ok(record)
    }

    /// Request cancellation of an in-flight run.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        if let Some((_, token)) = self.cancellations.remove(&run_id) {
            tracing::info!(run_id = %run_id, "cancelling workflow run");
            token.cancel();
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Batch loop
    // -----------------------------------------------------------------------

    async fn run_batches(
        &self,
        def: &WorkflowDefinition,
        plan: &ExecutionPlan<'_>,
        env: &LeafEnv<S, A, P>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) -> Result<(), RunAbort> {
        let step_index: HashMap<&str, &Step> =
            def.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let scheduler = BatchScheduler::new(def.concurrency.unwrap_or(DEFAULT_CONCURRENCY));

        for batch in &plan.batches {
            if env.token.is_cancelled() {
                return Err(RunAbort::cancelled());
            }

            let mut leaves: Vec<&Step> = Vec::new();
            let mut structural: Vec<&Step> = Vec::new();
            for &step in batch {
                if ctx.is_skipped(&step.id) {
                    continue;
                }
                match step.kind {
                    StepKind::Conditional { .. } | StepKind::Loop { .. } => {
                        structural.push(step);
                    }
                    _ => leaves.push(step),
                }
            }

            let mut tasks = Vec::with_capacity(leaves.len());
            for &step in &leaves {
                self.publish_step_started(ctx.run_id, step);
                let env = env.clone();
                let step = step.clone();
                let snapshot = ctx.clone();
                tasks.push((
                    step.id.clone(),
                    async move { run_leaf(&env, &step, &snapshot).await },
                ));
            }

            let mut outcomes = scheduler.run_batch(tasks).await;
            for &step in &leaves {
                let outcome = outcomes.remove(step.id.as_str()).unwrap_or(LeafOutcome {
                    result: Err(StepError {
                        kind: ErrorKind::External,
                        message: format!("step task for '{}' terminated abnormally", step.id),
                    }),
                    attempts: 0,
                    started_at: Utc::now(),
                });
                self.commit_leaf(step, outcome, def, plan, ctx, results)?;
            }

            for step in structural {
                if ctx.is_skipped(&step.id) {
                    continue;
                }
                match &step.kind {
                    StepKind::Conditional {
                        condition,
                        then_steps,
                        else_steps,
                    } => {
                        self.run_conditional(
                            step, condition, then_steps, else_steps, def, plan, &step_index,
                            env, ctx, results,
                        )
                        .await?;
                    }
                    StepKind::Loop {
                        source,
                        max_iterations,
                        steps,
                    } => {
                        self.run_loop(
                            step,
                            source,
                            *max_iterations,
                            steps,
                            def,
                            plan,
                            env,
                            ctx,
                            results,
                        )
                        .await?;
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Structural steps
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_conditional(
        &self,
        step: &Step,
        condition: &str,
        then_steps: &[String],
        else_steps: &[String],
        def: &WorkflowDefinition,
        plan: &ExecutionPlan<'_>,
        step_index: &HashMap<&str, &Step>,
        env: &LeafEnv<S, A, P>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) -> Result<(), RunAbort> {
        let started_at = Utc::now();
        self.publish_step_started(ctx.run_id, step);

        let take_then = match condition::evaluate_condition(condition, ctx) {
            Ok(v) => v,
            Err(e) => {
                // Neither branch runs when the condition itself fails.
                let members: Vec<String> =
                    then_steps.iter().chain(else_steps).cloned().collect();
                self.cascade_skip(plan, members, "conditional failed", ctx, results);
                return self.handle_step_failure(
                    step,
                    e.to_step_error(),
                    started_at,
                    1,
                    def,
                    plan,
                    ctx,
                    results,
                );
            }
        };

        let branch = if take_then {
            BranchTaken::Then
        } else {
            BranchTaken::Else
        };
        let (selected, rejected) = if take_then {
            (then_steps, else_steps)
        } else {
            (else_steps, then_steps)
        };
        tracing::debug!(
            step_id = %step.id,
            branch = if take_then { "then" } else { "else" },
            "condition evaluated"
        );
        self.cascade_skip(plan, rejected.to_vec(), "branch not taken", ctx, results);

        let output = json!({ "branch": if take_then { "then" } else { "else" } });
        if let Err(e) = ctx.set_step_output(&step.id, output.clone()) {
            return Err(RunAbort::failed(e.to_string()));
        }
        self.events.publish(ExecutionEvent::StepCompleted {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            output: output.clone(),
            duration_ms: elapsed_ms(started_at),
            attempts: 1,
            branch: Some(branch),
            timestamp: Utc::now(),
        });
        let mut result = StepResult::success(&step.id, output, started_at, 1);
        result.branch = Some(branch);
        results.push(result);

        // Taken members run inline, in list order.
        for member_id in selected {
            if ctx.is_skipped(member_id) {
                continue;
            }
            let Some(&member) = step_index.get(member_id.as_str()) else {
                continue;
            };
            self.publish_step_started(ctx.run_id, member);
            let outcome = run_leaf(env, member, ctx).await;
            self.commit_leaf(member, outcome, def, plan, ctx, results)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        step: &Step,
        source: &str,
        max_iterations: u32,
        body: &[Step],
        def: &WorkflowDefinition,
        plan: &ExecutionPlan<'_>,
        env: &LeafEnv<S, A, P>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) -> Result<(), RunAbort> {
        let started_at = Utc::now();
        self.publish_step_started(ctx.run_id, step);

        let frames = match loops::expand_source(source, max_iterations, ctx) {
            Ok(frames) => frames,
            Err(e) => {
                return self.handle_step_failure(
                    step,
                    e.to_step_error(),
                    started_at,
                    1,
                    def,
                    plan,
                    ctx,
                    results,
                );
            }
        };

        let total = frames.len();
        let mut iterations: Vec<Value> = Vec::with_capacity(total);
        for frame in frames {
            let index = frame.index;
            ctx.push_loop_frame(frame);

            let mut iteration = serde_json::Map::new();
            let mut failure: Option<StepError> = None;
            for body_step in body {
                self.publish_step_started(ctx.run_id, body_step);
                let outcome = run_leaf(env, body_step, ctx).await;
                match outcome.result {
                    Ok(output) => {
                        self.events.publish(ExecutionEvent::StepCompleted {
                            run_id: ctx.run_id,
                            step_id: body_step.id.clone(),
                            output: output.clone(),
                            duration_ms: elapsed_ms(outcome.started_at),
                            attempts: outcome.attempts,
                            branch: None,
                            timestamp: Utc::now(),
                        });
                        if let Err(e) = ctx.set_step_output(&body_step.id, output.clone()) {
                            ctx.pop_loop_frame();
                            return Err(RunAbort::failed(e.to_string()));
                        }
                        let mut body_result = StepResult::success(
                            &body_step.id,
                            output.clone(),
                            outcome.started_at,
                            outcome.attempts,
                        );
                        body_result.iteration = Some(index);
                        results.push(body_result);
                        iteration.insert(body_step.id.clone(), output);
                    }
                    Err(err) => {
                        self.events.publish(ExecutionEvent::StepFailed {
                            run_id: ctx.run_id,
                            step_id: body_step.id.clone(),
                            error: err.clone(),
                            attempts: outcome.attempts,
                            timestamp: Utc::now(),
                        });
                        let mut body_result = StepResult::failed(
                            &body_step.id,
                            err.clone(),
                            outcome.started_at,
                            outcome.attempts,
                        );
                        body_result.iteration = Some(index);
                        results.push(body_result);
                        failure = Some(StepError {
                            kind: err.kind,
                            message: format!(
                                "iteration {index}: body step '{}' failed: {}",
                                body_step.id, err.message
                            ),
                        });
                        break;
                    }
                }
            }
            ctx.pop_loop_frame();

            if let Some(err) = failure {
                clear_body_outputs(ctx, body);
                return self
                    .handle_step_failure(step, err, started_at, 1, def, plan, ctx, results);
            }
            iterations.push(Value::Object(iteration));
        }

        // Body step outputs are iteration-local, not run outputs.
        clear_body_outputs(ctx, body);

        let output = json!({ "iterations": total, "results": iterations });
        self.commit_leaf(
            step,
            LeafOutcome {
                result: Ok(output),
                attempts: 1,
                started_at,
            },
            def,
            plan,
            ctx,
            results,
        )
    }

    // -----------------------------------------------------------------------
    // Result handling
    // -----------------------------------------------------------------------

    /// Record a completed leaf execution: merge output into the context or
    /// drive error propagation.
    fn commit_leaf(
        &self,
        step: &Step,
        outcome: LeafOutcome,
        def: &WorkflowDefinition,
        plan: &ExecutionPlan<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) -> Result<(), RunAbort> {
        match outcome.result {
            Ok(output) => {
                if let Err(e) = ctx.set_step_output(&step.id, output.clone()) {
                    return Err(RunAbort::failed(e.to_string()));
                }
                self.events.publish(ExecutionEvent::StepCompleted {
                    run_id: ctx.run_id,
                    step_id: step.id.clone(),
                    output: output.clone(),
                    duration_ms: elapsed_ms(outcome.started_at),
                    attempts: outcome.attempts,
                    branch: None,
                    timestamp: Utc::now(),
                });
                tracing::debug!(step_id = %step.id, attempts = outcome.attempts, "step completed");
                results.push(StepResult::success(
                    &step.id,
                    output,
                    outcome.started_at,
                    outcome.attempts,
                ));
                Ok(())
            }
            Err(err) => self.handle_step_failure(
                step,
                err,
                outcome.started_at,
                outcome.attempts,
                def,
                plan,
                ctx,
                results,
            ),
        }
    }

    /// Record a terminal step failure and apply its propagation policy.
    #[allow(clippy::too_many_arguments)]
    fn handle_step_failure(
        &self,
        step: &Step,
        err: StepError,
        started_at: DateTime<Utc>,
        attempts: u32,
        def: &WorkflowDefinition,
        plan: &ExecutionPlan<'_>,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) -> Result<(), RunAbort> {
        self.events.publish(ExecutionEvent::StepFailed {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            error: err.clone(),
            attempts,
            timestamp: Utc::now(),
        });
        results.push(StepResult::failed(&step.id, err.clone(), started_at, attempts));

        if err.kind == ErrorKind::Cancelled {
            return Err(RunAbort::cancelled());
        }

        let propagation = step.error_propagation.unwrap_or(def.error_propagation);
        match propagation {
            ErrorPropagation::FailSilent => {
                tracing::warn!(step_id = %step.id, error = %err, "step failed, continuing");
                let roots = plan.dependents.get(&step.id).cloned().unwrap_or_default();
                self.cascade_skip(
                    plan,
                    roots,
                    &format!("upstream step '{}' failed", step.id),
                    ctx,
                    results,
                );
                Ok(())
            }
            // A fallback pair handles its own recovery; if it still failed,
            // treat it like fail-fast.
            ErrorPropagation::FailFast | ErrorPropagation::Fallback => {
                tracing::error!(step_id = %step.id, error = %err, "step failed, aborting run");
                Err(RunAbort::failed(format!("step '{}' failed: {err}", step.id)))
            }
        }
    }

    /// Transitively mark `roots` and everything that depends on them as
    /// skipped.
    fn cascade_skip(
        &self,
        plan: &ExecutionPlan<'_>,
        roots: Vec<String>,
        reason: &str,
        ctx: &mut ExecutionContext,
        results: &mut Vec<StepResult>,
    ) {
        let mut queue: VecDeque<String> = roots.into();
        while let Some(id) = queue.pop_front() {
            if ctx.is_skipped(&id) {
                continue;
            }
            ctx.mark_skipped(&id);
            tracing::debug!(step_id = %id, reason, "step skipped");
            self.events.publish(ExecutionEvent::StepSkipped {
                run_id: ctx.run_id,
                step_id: id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
            results.push(StepResult::skipped(&id));
            if let Some(dependents) = plan.dependents.get(&id) {
                queue.extend(dependents.iter().cloned());
            }
        }
    }

    fn publish_step_started(&self, run_id: Uuid, step: &Step) {
        self.events.publish(ExecutionEvent::StepStarted {
            run_id,
            step_id: step.id.clone(),
            step_type: step.kind.type_name().to_string(),
            timestamp: Utc::now(),
        });
    }
}

impl<S, A, P> WorkflowRunner for WorkflowEngine<S, A, P>
where
    S: ScriptPort + 'static,
    A: AiPort + 'static,
    P: ApprovalPort + 'static,
{
    async fn execute(
        &self,
        def: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ExecutionRecord, EngineError> {
        WorkflowEngine::execute(self, def, inputs).await
    }

    fn cancel(&self, run_id: Uuid) -> bool {
        WorkflowEngine::cancel(self, run_id)
    }
}

// ---------------------------------------------------------------------------
// Run-level plumbing
// ---------------------------------------------------------------------------

/// Terminal failure of a run: carries the final status and the run-level
/// error message.
#[derive(Debug)]
struct RunAbort {
    status: RunStatus,
    error: String,
}

impl RunAbort {
    fn failed(error: String) -> Self {
        Self {
            status: RunStatus::Failed,
            error,
        }
    }

    fn cancelled() -> Self {
        Self {
            status: RunStatus::Aborted,
            error: "run cancelled".to_string(),
        }
    }
}

/// Merge caller inputs over declared defaults and type-check them.
fn resolve_run_inputs(
    def: &WorkflowDefinition,
    mut provided: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, EngineError> {
    let mut resolved = BTreeMap::new();
    for (name, decl) in &def.inputs {
        match provided.remove(name) {
            Some(value) => {
                if !decl.input_type.matches(&value) {
                    return Err(EngineError::InvalidInput(format!(
                        "input '{name}' does not match its declared type"
                    )));
                }
                resolved.insert(name.clone(), value);
            }
            None => match &decl.default {
                Some(default) => {
                    resolved.insert(name.clone(), default.clone());
                }
                None if decl.required => {
                    return Err(EngineError::InvalidInput(format!(
                        "missing required input '{name}'"
                    )));
                }
                None => {
                    resolved.insert(name.clone(), Value::Null);
                }
            },
        }
    }
    if let Some(name) = provided.keys().next() {
        return Err(EngineError::InvalidInput(format!("unknown input '{name}'")));
    }
    Ok(resolved)
}

fn elapsed_ms(started_at: DateTime<Utc>) -> u64 {
    (Utc::now() - started_at).num_milliseconds().max(0) as u64
}

fn clear_body_outputs(ctx: &mut ExecutionContext, body: &[Step]) {
    for step in body {
        ctx.step_outputs.remove(&step.id);
    }
}

// ---------------------------------------------------------------------------
// Leaf execution
// ---------------------------------------------------------------------------

/// Everything a spawned leaf task needs, cheap to clone.
struct LeafEnv<S, A, P> {
    scripts: Arc<S>,
    ai: Arc<A>,
    approvals: Arc<P>,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    default_timeout_ms: Option<u64>,
    token: CancellationToken,
}

impl<S, A, P> Clone for LeafEnv<S, A, P> {
    fn clone(&self) -> Self {
        Self {
            scripts: Arc::clone(&self.scripts),
            ai: Arc::clone(&self.ai),
            approvals: Arc::clone(&self.approvals),
            breakers: Arc::clone(&self.breakers),
            default_timeout_ms: self.default_timeout_ms,
            token: self.token.clone(),
        }
    }
}

/// Terminal outcome of one leaf step execution.
struct LeafOutcome {
    result: Result<Value, StepError>,
    attempts: u32,
    started_at: DateTime<Utc>,
}

/// Execute a leaf step (script, AI call, or fallback pair) to a terminal
/// outcome, including retries.
async fn run_leaf<S, A, P>(
    env: &LeafEnv<S, A, P>,
    step: &Step,
    ctx: &ExecutionContext,
) -> LeafOutcome
where
    S: ScriptPort,
    A: AiPort,
    P: ApprovalPort,
{
    let started_at = Utc::now();
    match &step.kind {
        StepKind::Fallback { primary, fallback } => {
            let (primary_result, primary_attempts) = run_attempts(env, primary, ctx).await;
            match primary_result {
                Ok(output) => LeafOutcome {
                    result: Ok(output),
                    attempts: primary_attempts,
                    started_at,
                },
                Err(primary_err) if primary_err.kind == ErrorKind::Cancelled => LeafOutcome {
                    result: Err(primary_err),
                    attempts: primary_attempts,
                    started_at,
                },
                Err(primary_err) => {
                    tracing::warn!(
                        step_id = %step.id,
                        primary = %primary.id,
                        error = %primary_err,
                        "primary failed, running fallback"
                    );
                    let mut fallback_ctx = ctx.clone();
                    fallback_ctx.fallback_error = Some(primary_err);
                    let (result, fallback_attempts) =
                        run_attempts(env, fallback, &fallback_ctx).await;
                    LeafOutcome {
                        result,
                        attempts: primary_attempts + fallback_attempts,
                        started_at,
                    }
                }
            }
        }
        _ => {
            let (result, attempts) = run_attempts(env, step, ctx).await;
            LeafOutcome {
                result,
                attempts,
                started_at,
            }
        }
    }
}

/// Drive one step through its approval gate, circuit breaker, and retry
/// policy. Returns the terminal result and the number of attempts made.
async fn run_attempts<S, A, P>(
    env: &LeafEnv<S, A, P>,
    step: &Step,
    ctx: &ExecutionContext,
) -> (Result<Value, StepError>, u32)
where
    S: ScriptPort,
    A: AiPort,
    P: ApprovalPort,
{
    // Side-effecting steps are gated once, before any attempt. A denial is
    // permission_denied and is never retried.
    if step.kind.has_side_effects() {
        let description = match &step.kind {
            StepKind::Script { script } => script.as_str(),
            _ => step.kind.type_name(),
        };
        match env.approvals.request_approval(&step.id, description).await {
            Ok(true) => {}
            Ok(false) => {
                return (
                    Err(StepError {
                        kind: ErrorKind::PermissionDenied,
                        message: format!("approval denied for step '{}'", step.id),
                    }),
                    1,
                );
            }
            Err(e) => return (Err(e.to_step_error()), 1),
        }
    }

    let breaker = step.circuit_breaker.as_ref().map(|cfg| {
        let entry = env
            .breakers
            .entry(step.id.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(cfg.clone())));
        Arc::clone(&*entry)
    });

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        if let Some(b) = &breaker {
            if b.check() == BreakerDecision::Reject {
                let err = EngineError::CircuitOpen {
                    step_id: step.id.clone(),
                };
                return (Err(err.to_step_error()), attempt);
            }
        }

        match attempt_once(env, step, ctx).await {
            Ok(output) => {
                if let Some(b) = &breaker {
                    b.record_success();
                }
                return (Ok(output), attempt);
            }
            Err(e) => {
                let kind = e.kind();
                if let Some(b) = &breaker {
                    // Rejections and cancellations are not execution failures.
                    if !matches!(kind, ErrorKind::CircuitOpen | ErrorKind::Cancelled) {
                        b.record_failure();
                    }
                }
                if retry::should_retry(step.retry.as_ref(), attempt, kind) {
                    let delay = step
                        .retry
                        .as_ref()
                        .map(|policy| retry::delay_for(policy, attempt))
                        .unwrap_or_default();
                    tracing::debug!(
                        step_id = %step.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying step"
                    );
                    tokio::select! {
                        _ = env.token.cancelled() => {
                            return (Err(EngineError::Cancelled.to_step_error()), attempt);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    return (Err(e.to_step_error()), attempt);
                }
            }
        }
    }
}

/// One attempt at a script or AI call: resolve inputs, dispatch to the
/// port, and enforce the effective timeout.
async fn attempt_once<S, A, P>(
    env: &LeafEnv<S, A, P>,
    step: &Step,
    ctx: &ExecutionContext,
) -> Result<Value, EngineError>
where
    S: ScriptPort,
    A: AiPort,
    P: ApprovalPort,
{
    if env.token.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let resolved = resolver::resolve_inputs(&step.inputs, ctx)?;
    let input = Value::Object(resolved);
    let timeout_ms = step
        .timeout_ms
        .or(env.default_timeout_ms)
        .unwrap_or(DEFAULT_STEP_TIMEOUT_MS);
    let budget = Duration::from_millis(timeout_ms);

    match &step.kind {
        StepKind::Script { script } => {
            let script_path = match resolver::resolve(script, ctx)? {
                Value::String(path) => path,
                other => other.to_string(),
            };
            let call = env.scripts.execute(&script_path, &input);
            tokio::select! {
                _ = env.token.cancelled() => Err(EngineError::Cancelled),
                outcome = tokio::time::timeout(budget, call) => match outcome {
                    Ok(result) => result.map(|o| o.stdout),
                    Err(_) => Err(EngineError::Timeout { timeout_ms }),
                },
            }
        }
        StepKind::AiCall { prompt, model } => {
            let prompt_text = match resolver::resolve(prompt, ctx)? {
                Value::String(text) => text,
                other => other.to_string(),
            };
            let call = env.ai.send(&prompt_text, model.as_deref());
            tokio::select! {
                _ = env.token.cancelled() => Err(EngineError::Cancelled),
                outcome = tokio::time::timeout(budget, call) => match outcome {
                    Ok(result) => result.map(Value::String),
                    Err(_) => Err(EngineError::Timeout { timeout_ms }),
                },
            }
        }
        other => Err(EngineError::Validation {
            step_id: step.id.clone(),
            reason: format!("'{}' steps cannot execute directly", other.type_name()),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
