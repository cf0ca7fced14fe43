//! Dependency graph analysis: edge derivation, cycle detection, and
//! parallel batch computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Edges
//! come from two sources: explicit `depends_on` entries and implicit
//! references (`${steps.<id>...}` appearing anywhere in a step's
//! configuration: inputs, prompts, script paths, conditions, and loop
//! sources). Topological sort detects cycles, and depth-based grouping
//! produces batches where all steps in a batch can run concurrently.
//!
//! Steps claimed by a conditional's branch lists are excluded from the
//! top-level batches -- the conditional runs them itself when a branch is
//! taken. Dependencies into and out of branch members are lifted to the
//! owning conditional so batch ordering stays correct.

use std::collections::{BTreeSet, HashMap};

use loomflow_types::workflow::{Step, StepKind};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;

use crate::error::EngineError;
use crate::resolver;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// The analyzed shape of a workflow: batches to execute in order, plus the
/// maps the executor needs for skip cascading and branch handling.
#[derive(Debug)]
pub struct ExecutionPlan<'a> {
    /// Steps grouped into batches; all steps within a batch have their
    /// dependencies satisfied by earlier batches. Branch members are not
    /// included here.
    pub batches: Vec<Vec<&'a Step>>,
    /// Direct dependents of each step (unlifted -- a step that references a
    /// branch member appears as a dependent of the member itself). Drives
    /// the skip cascade.
    pub dependents: HashMap<String, Vec<String>>,
    /// Branch member step ID -> owning conditional step ID.
    pub branch_owner: HashMap<String, String>,
}

/// Build the execution plan for a workflow's top-level steps.
///
/// Fails with a validation error on unknown dependency targets, a step
/// claimed by more than one branch, or a dependency cycle (reported with
/// the full cycle path).
pub fn build_execution_plan(steps: &[Step]) -> Result<ExecutionPlan<'_>, EngineError> {
    if steps.is_empty() {
        return Ok(ExecutionPlan {
            batches: vec![],
            dependents: HashMap::new(),
            branch_owner: HashMap::new(),
        });
    }

    let known: BTreeSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let branch_owner = branch_owners(steps)?;

    // Raw dependency targets per step: explicit depends_on plus implicit
    // reference edges, validated against the known step set.
    let mut raw_targets: HashMap<&str, BTreeSet<String>> = HashMap::new();
    for step in steps {
        let mut targets = BTreeSet::new();
        for dep in &step.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(EngineError::Validation {
                    step_id: step.id.clone(),
                    reason: format!("depends on unknown step '{dep}'"),
                });
            }
            targets.insert(dep.clone());
        }
        for referenced in reference_targets(step) {
            if !known.contains(referenced.as_str()) {
                return Err(EngineError::Validation {
                    step_id: step.id.clone(),
                    reason: format!("references unknown step '{referenced}'"),
                });
            }
            targets.insert(referenced);
        }
        raw_targets.insert(step.id.as_str(), targets);
    }

    // Batching graph over non-member steps only.
    let top_level: Vec<&Step> = steps
        .iter()
        .filter(|s| !branch_owner.contains_key(s.id.as_str()))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let mut node_of: HashMap<&str, _> = HashMap::new();
    for step in &top_level {
        node_of.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
    }

    let mut add_edge = |graph: &mut DiGraph<&str, ()>, from: &str, to: &str| {
        if let (Some(&a), Some(&b)) = (node_of.get(from), node_of.get(to)) {
            if !graph.contains_edge(a, b) {
                graph.add_edge(a, b, ());
            }
        }
    };

    for step in steps {
        let is_member = branch_owner.contains_key(step.id.as_str());
        // A member's dependencies become dependencies of its conditional:
        // the conditional must not run before the member's inputs exist.
        let effective_id = if is_member {
            lift(&branch_owner, step.id.as_str())
        } else {
            step.id.as_str()
        };
        for target in &raw_targets[step.id.as_str()] {
            if target == &step.id {
                return Err(EngineError::Validation {
                    step_id: step.id.clone(),
                    reason: format!("dependency cycle: {} -> {}", step.id, step.id),
                });
            }
            let lifted = lift(&branch_owner, target.as_str());
            if lifted == effective_id {
                if is_member {
                    // Member -> owner and member -> sibling-member edges are
                    // satisfied by the conditional running its branch inline.
                    continue;
                }
                // A conditional depending on its own branch member can never
                // be satisfied: the member only runs after the conditional.
                return Err(EngineError::Validation {
                    step_id: step.id.clone(),
                    reason: format!(
                        "dependency cycle: {} -> {} -> {}",
                        step.id, target, step.id
                    ),
                });
            }
            add_edge(&mut graph, lifted, effective_id);
        }
    }

    // Topological sort detects cycles; report the full cycle path.
    let sorted = toposort(&graph, None).map_err(|_| {
        let path = cycle_path(&graph);
        EngineError::Validation {
            step_id: path.first().cloned().unwrap_or_default(),
            reason: format!("dependency cycle: {}", path.join(" -> ")),
        }
    })?;

    // Depth per node: max dependency depth + 1, roots at 0.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for &node in &sorted {
        let depth = graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|dep| depths.get(graph[dep]).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(graph[node], depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut batches: Vec<Vec<&Step>> = vec![vec![]; max_depth + 1];
    for step in &top_level {
        batches[depths[step.id.as_str()]].push(*step);
    }

    // Unlifted dependents map for the skip cascade: if a branch member is
    // skipped, steps referencing that member directly must cascade too.
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for step in steps {
        for target in &raw_targets[step.id.as_str()] {
            dependents
                .entry(target.clone())
                .or_default()
                .push(step.id.clone());
        }
    }
    // Branch members are also dependents of their conditional.
    for (member, owner) in &branch_owner {
        dependents
            .entry(owner.clone())
            .or_default()
            .push(member.clone());
    }

    Ok(ExecutionPlan {
        batches,
        dependents,
        branch_owner,
    })
}

/// Lift a target out of its branch: a dependency on a branch member is a
/// dependency on the owning conditional for ordering purposes. Conditionals
/// can nest through ownership chains, so lifting follows the chain up.
fn lift<'a>(owners: &'a HashMap<String, String>, mut target: &'a str) -> &'a str {
    let mut hops = 0;
    while let Some(owner) = owners.get(target) {
        target = owner.as_str();
        hops += 1;
        if hops > owners.len() {
            break;
        }
    }
    target
}

/// Map each branch member to its owning conditional, rejecting steps
/// claimed by more than one branch or by a nonexistent member reference.
pub fn branch_owners(steps: &[Step]) -> Result<HashMap<String, String>, EngineError> {
    let known: BTreeSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut owners: HashMap<String, String> = HashMap::new();

    for step in steps {
        if let StepKind::Conditional {
            then_steps,
            else_steps,
            ..
        } = &step.kind
        {
            for member in then_steps.iter().chain(else_steps) {
                if !known.contains(member.as_str()) {
                    return Err(EngineError::Validation {
                        step_id: step.id.clone(),
                        reason: format!("branch names unknown step '{member}'"),
                    });
                }
                if member == &step.id {
                    return Err(EngineError::Validation {
                        step_id: step.id.clone(),
                        reason: "conditional cannot claim itself as a branch member".to_string(),
                    });
                }
                if let Some(existing) = owners.insert(member.clone(), step.id.clone()) {
                    return Err(EngineError::Validation {
                        step_id: member.clone(),
                        reason: format!(
                            "claimed by both '{existing}' and '{}' branches",
                            step.id
                        ),
                    });
                }
            }
        }
    }

    Ok(owners)
}

/// All step IDs a step references via `${steps.<id>...}`, including inside
/// embedded loop bodies and fallback children (minus IDs local to those
/// bodies).
fn reference_targets(step: &Step) -> Vec<String> {
    let mut targets = Vec::new();
    collect_reference_targets(step, &mut BTreeSet::new(), &mut targets);
    targets
}

fn collect_reference_targets(step: &Step, local: &mut BTreeSet<String>, out: &mut Vec<String>) {
    for expression in step.inputs.values() {
        out.extend(resolver::referenced_step_ids(expression));
    }

    match &step.kind {
        StepKind::Conditional { condition, .. } => {
            out.extend(resolver::referenced_step_ids(condition));
        }
        StepKind::Loop { source, steps, .. } => {
            out.extend(resolver::referenced_step_ids(source));
            for body in steps {
                local.insert(body.id.clone());
            }
            for body in steps {
                collect_reference_targets(body, local, out);
            }
        }
        StepKind::Fallback { primary, fallback } => {
            local.insert(primary.id.clone());
            local.insert(fallback.id.clone());
            collect_reference_targets(primary, local, out);
            collect_reference_targets(fallback, local, out);
        }
        StepKind::Script { script } => {
            out.extend(resolver::referenced_step_ids(script));
        }
        StepKind::AiCall { prompt, .. } => {
            out.extend(resolver::referenced_step_ids(prompt));
        }
    }

    out.retain(|id| !local.contains(id));
}

/// Reconstruct a cycle path from the smallest strongly connected component
/// larger than one node (or a self-loop), closing the loop for display.
fn cycle_path(graph: &DiGraph<&str, ()>) -> Vec<String> {
    for component in tarjan_scc(graph) {
        if component.len() > 1 {
            let mut path: Vec<String> = component.iter().map(|&n| graph[n].to_string()).collect();
            path.reverse();
            if let Some(first) = path.first().cloned() {
                path.push(first);
            }
            return path;
        }
        if component.len() == 1 && graph.contains_edge(component[0], component[0]) {
            let id = graph[component[0]].to_string();
            return vec![id.clone(), id];
        }
    }
    vec![]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
