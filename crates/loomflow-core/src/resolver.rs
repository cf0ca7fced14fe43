//! Variable resolution for `${...}` references.
//!
//! Resolution is scoped: references address workflow inputs
//! (`${workflow.inputs.<name>}`), upstream step outputs
//! (`${steps.<id>.outputs.<path>}`), the innermost loop frame
//! (`${loop.item}`, `${loop.index}`, `${loop.key}`, `${loop.value}`), and --
//! inside fallback steps only -- the primary's captured failure
//! (`${error.kind}`, `${error.message}`).
//!
//! A string that is exactly one reference resolves to the referenced value
//! with its type preserved. References embedded in a longer string are
//! interpolated: strings splice in unquoted, scalars via their literal
//! form, and objects/arrays as compact JSON. Any unresolvable reference is
//! an error naming the full path -- never silently left in place.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Placeholder scanning
// ---------------------------------------------------------------------------

/// A `${...}` occurrence within an expression string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    /// Byte offset of the `$`.
    start: usize,
    /// Byte offset one past the closing `}`.
    end: usize,
    /// The dotted path between the braces, trimmed.
    path: String,
}

/// Scan all `${...}` placeholders in the input.
///
/// An unterminated `${` is a reference error: leaving it in place would
/// silently feed garbage downstream.
fn scan_placeholders(input: &str) -> Result<Vec<Placeholder>, EngineError> {
    let mut found = Vec::new();
    let mut rest = input;
    let mut offset = 0;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(close) = after.find('}') else {
            return Err(EngineError::Reference {
                path: rest[start..].to_string(),
                reason: "unterminated '${' reference".to_string(),
            });
        };
        found.push(Placeholder {
            start: offset + start,
            end: offset + start + 2 + close + 1,
            path: after[..close].trim().to_string(),
        });
        offset += start + 2 + close + 1;
        rest = &rest[start + 2 + close + 1..];
    }

    Ok(found)
}

/// All reference paths appearing in an expression, in order of occurrence.
///
/// Used by the DAG builder to derive implicit dependency edges. Returns an
/// empty list for malformed input; malformed references surface as errors
/// at resolution time instead.
pub fn find_references(input: &str) -> Vec<String> {
    scan_placeholders(input)
        .map(|ps| ps.into_iter().map(|p| p.path).collect())
        .unwrap_or_default()
}

/// Step IDs referenced via `${steps.<id>...}` in an expression.
pub fn referenced_step_ids(input: &str) -> Vec<String> {
    find_references(input)
        .into_iter()
        .filter_map(|path| {
            let rest = path.strip_prefix("steps.")?;
            let id = rest.split('.').next()?;
            (!id.is_empty()).then(|| id.to_string())
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every `${...}` reference in `input` against the run context.
///
/// If the whole (trimmed) input is a single reference, the referenced value
/// is returned with its type preserved. Otherwise the result is a string
/// with each reference interpolated.
pub fn resolve(input: &str, ctx: &ExecutionContext) -> Result<Value, EngineError> {
    let placeholders = scan_placeholders(input)?;

    if placeholders.is_empty() {
        return Ok(Value::String(input.to_string()));
    }

    // Whole-string single reference: type-preserving.
    let trimmed_start = input.len() - input.trim_start().len();
    let trimmed_end = input.trim_end().len();
    if placeholders.len() == 1
        && placeholders[0].start == trimmed_start
        && placeholders[0].end == trimmed_end
    {
        return resolve_path(&placeholders[0].path, ctx);
    }

    // Embedded references: interpolate into a string.
    let mut result = String::with_capacity(input.len());
    let mut cursor = 0;
    for placeholder in &placeholders {
        result.push_str(&input[cursor..placeholder.start]);
        let value = resolve_path(&placeholder.path, ctx)?;
        result.push_str(&value_to_display_string(&value));
        cursor = placeholder.end;
    }
    result.push_str(&input[cursor..]);

    Ok(Value::String(result))
}

/// Resolve a step's named input expressions into a JSON object.
pub fn resolve_inputs(
    inputs: &std::collections::BTreeMap<String, String>,
    ctx: &ExecutionContext,
) -> Result<serde_json::Map<String, Value>, EngineError> {
    let mut resolved = serde_json::Map::new();
    for (name, expression) in inputs {
        resolved.insert(name.clone(), resolve(expression, ctx)?);
    }
    Ok(resolved)
}

/// Resolve a single dotted reference path against the context.
pub fn resolve_path(path: &str, ctx: &ExecutionContext) -> Result<Value, EngineError> {
    let segments: Vec<&str> = path.split('.').collect();

    let reference_error = |reason: String| EngineError::Reference {
        path: path.to_string(),
        reason,
    };

    match segments.first().copied() {
        Some("workflow") => {
            if segments.get(1).copied() != Some("inputs") {
                return Err(reference_error(
                    "only 'workflow.inputs.<name>' is addressable".to_string(),
                ));
            }
            let name = segments
                .get(2)
                .copied()
                .ok_or_else(|| reference_error("missing input name".to_string()))?;
            let value = ctx
                .inputs
                .get(name)
                .ok_or_else(|| reference_error(format!("no workflow input named '{name}'")))?;
            navigate(value, &segments[3..], path)
        }

        Some("steps") => {
            let step_id = segments
                .get(1)
                .copied()
                .ok_or_else(|| reference_error("missing step id".to_string()))?;
            if ctx.is_skipped(step_id) {
                return Err(reference_error(format!(
                    "step '{step_id}' was skipped and produced no output"
                )));
            }
            if segments.get(2).copied() != Some("outputs") {
                return Err(reference_error(format!(
                    "only 'steps.{step_id}.outputs' is addressable"
                )));
            }
            let output = ctx.get_step_output(step_id).ok_or_else(|| {
                reference_error(format!("step '{step_id}' has not produced an output"))
            })?;
            navigate(output, &segments[3..], path)
        }

        Some("loop") => {
            let frame = ctx
                .current_loop_frame()
                .ok_or_else(|| reference_error("no enclosing loop".to_string()))?;
            let field = segments
                .get(1)
                .copied()
                .ok_or_else(|| reference_error("missing loop field".to_string()))?;
            let value = match field {
                "item" | "value" => frame.item.clone(),
                "index" => Value::from(frame.index),
                "key" => match &frame.key {
                    Some(key) => Value::String(key.clone()),
                    None => {
                        return Err(reference_error(
                            "'loop.key' is only available when iterating an object".to_string(),
                        ));
                    }
                },
                other => {
                    return Err(reference_error(format!("unknown loop field '{other}'")));
                }
            };
            navigate(&value, &segments[2..], path)
        }

        Some("error") => {
            let error = ctx.fallback_error.as_ref().ok_or_else(|| {
                reference_error("'error.*' is only available inside a fallback step".to_string())
            })?;
            match segments.get(1).copied() {
                Some("kind") => Ok(Value::String(error.kind.as_str().to_string())),
                Some("message") => Ok(Value::String(error.message.clone())),
                _ => Err(reference_error(
                    "only 'error.kind' and 'error.message' are addressable".to_string(),
                )),
            }
        }

        Some(other) => Err(reference_error(format!(
            "unknown reference root '{other}' (expected workflow, steps, loop, or error)"
        ))),
        None => Err(reference_error("empty reference".to_string())),
    }
}

/// Walk nested object keys / array indices along the remaining segments.
fn navigate(value: &Value, segments: &[&str], full_path: &str) -> Result<Value, EngineError> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment).ok_or_else(|| EngineError::Reference {
                path: full_path.to_string(),
                reason: format!("no field '{segment}'"),
            })?,
            Value::Array(items) => {
                let index: usize = segment.parse().map_err(|_| EngineError::Reference {
                    path: full_path.to_string(),
                    reason: format!("'{segment}' is not a valid array index"),
                })?;
                items.get(index).ok_or_else(|| EngineError::Reference {
                    path: full_path.to_string(),
                    reason: format!("index {index} out of bounds (len {})", items.len()),
                })?
            }
            _ => {
                return Err(EngineError::Reference {
                    path: full_path.to_string(),
                    reason: format!("cannot descend into '{segment}' on a scalar value"),
                });
            }
        };
    }
    Ok(current.clone())
}

/// Interpolation form of a value: strings unquoted, scalars literal,
/// objects/arrays as compact JSON.
fn value_to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
