//! Loop iteration source expansion and bounds enforcement.
//!
//! A loop's `source` expression resolves to an array (iterate items), an
//! object (iterate entries in sorted key order), or a `range(start, end)`
//! expression (end-exclusive integers). Expansion happens before any
//! iteration runs, so a source that exceeds the iteration limit fails the
//! step with zero iterations executed.

use serde_json::Value;

use crate::context::{ExecutionContext, LoopFrame};
use crate::error::EngineError;
use crate::resolver;
use loomflow_types::workflow::LOOP_ITERATION_CEILING;

/// Expand a loop source into iteration frames, enforcing the iteration
/// limit up front.
///
/// The effective limit is `min(max_iterations, LOOP_ITERATION_CEILING)`;
/// a source yielding more frames than that is a loop-limit error and no
/// frames are returned.
pub fn expand_source(
    source: &str,
    max_iterations: u32,
    ctx: &ExecutionContext,
) -> Result<Vec<LoopFrame>, EngineError> {
    let frames = resolve_frames(source, ctx)?;

    let limit = max_iterations.min(LOOP_ITERATION_CEILING);
    if frames.len() > limit as usize {
        return Err(EngineError::LoopLimitExceeded {
            actual: frames.len(),
            limit,
        });
    }

    Ok(frames)
}

fn resolve_frames(source: &str, ctx: &ExecutionContext) -> Result<Vec<LoopFrame>, EngineError> {
    let trimmed = source.trim();

    if let Some(args) = trimmed
        .strip_prefix("range(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return expand_range(trimmed, args, ctx);
    }

    let value = resolver::resolve(trimmed, ctx)?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, item)| LoopFrame {
                item,
                index,
                key: None,
            })
            .collect()),
        Value::Object(map) => {
            // BTreeMap-backed or not, iterate entries in sorted key order so
            // iteration order is deterministic.
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(entries
                .into_iter()
                .enumerate()
                .map(|(index, (key, item))| LoopFrame {
                    item,
                    index,
                    key: Some(key),
                })
                .collect())
        }
        other => Err(EngineError::Evaluation {
            expression: source.to_string(),
            reason: format!(
                "loop source must be an array, object, or range(), got {}",
                json_type_name(&other)
            ),
        }),
    }
}

/// Expand `range(start, end)` -- end-exclusive. Arguments are integer
/// literals or `${...}` references resolving to integers. An empty or
/// inverted range yields zero iterations.
fn expand_range(
    full: &str,
    args: &str,
    ctx: &ExecutionContext,
) -> Result<Vec<LoopFrame>, EngineError> {
    let parts: Vec<&str> = args.split(',').collect();
    if parts.len() != 2 {
        return Err(EngineError::Evaluation {
            expression: full.to_string(),
            reason: "range() takes exactly two arguments".to_string(),
        });
    }

    let start = range_bound(full, parts[0], ctx)?;
    let end = range_bound(full, parts[1], ctx)?;

    if end <= start {
        return Ok(vec![]);
    }

    Ok((start..end)
        .enumerate()
        .map(|(index, n)| LoopFrame {
            item: Value::from(n),
            index,
            key: None,
        })
        .collect())
}

fn range_bound(full: &str, raw: &str, ctx: &ExecutionContext) -> Result<i64, EngineError> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(n);
    }
    let value = resolver::resolve(raw, ctx)?;
    value.as_i64().ok_or_else(|| EngineError::Evaluation {
        expression: full.to_string(),
        reason: format!("range bound '{raw}' is not an integer"),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
