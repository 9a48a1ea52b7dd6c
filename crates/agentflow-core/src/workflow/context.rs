//! Data flow between the execution context and steps.
//!
//! Input mappings pull values into a step's input from two namespaces:
//! `context.<path>` reads the execution context and `results.<step_id>.<path>`
//! reads a previous step's result. Any other source string is passed through
//! as a literal. Output mappings copy paths of a step's result back into the
//! context, creating nested objects for dotted targets.

use std::collections::HashMap;

use agentflow_types::workflow::StepConfig;
use serde_json::{json, Map, Value};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step result (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of the execution context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

const CONTEXT_PREFIX: &str = "context";
const RESULTS_PREFIX: &str = "results";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Follow a dotted path through objects (by key) and arrays (by index).
///
/// An empty path returns `value` itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at a dotted path, creating (or replacing non-object)
/// intermediate nodes with objects.
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = target;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Resolve one mapping source against the context and step results.
///
/// A recognised prefix whose path does not exist yields `null`.
pub fn resolve_source(
    source: &str,
    context: &Map<String, Value>,
    results: &HashMap<String, Value>,
) -> Value {
    let (prefix, rest) = source.split_once('.').unwrap_or((source, ""));
    match prefix {
        CONTEXT_PREFIX => {
            let (head, tail) = rest.split_once('.').unwrap_or((rest, ""));
            context
                .get(head)
                .and_then(|v| lookup_path(v, tail))
                .cloned()
                .unwrap_or(Value::Null)
        }
        RESULTS_PREFIX => {
            let (step_id, tail) = rest.split_once('.').unwrap_or((rest, ""));
            results
                .get(step_id)
                .and_then(|v| lookup_path(v, tail))
                .cloned()
                .unwrap_or(Value::Null)
        }
        _ => Value::String(source.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Step input / output
// ---------------------------------------------------------------------------

/// Build the input map for a step.
///
/// An empty `input_mapping` passes a copy of the whole context.
pub fn build_step_input(
    step: &StepConfig,
    context: &Map<String, Value>,
    results: &HashMap<String, Value>,
) -> Map<String, Value> {
    if step.input_mapping.is_empty() {
        return context.clone();
    }
    step.input_mapping
        .iter()
        .map(|(target, source)| (target.clone(), resolve_source(source, context, results)))
        .collect()
}

/// Merge mapped fields of a step result into the context.
///
/// Sources are dotted paths into `result`; missing sources write `null`. An
/// empty `output_mapping` merges nothing.
pub fn apply_output_mapping(step: &StepConfig, result: &Value, context: &mut Map<String, Value>) {
    for (target, source) in &step.output_mapping {
        let value = lookup_path(result, source).cloned().unwrap_or(Value::Null);
        set_path(context, target, value);
    }
}

/// Replace a step result that exceeds `MAX_STEP_OUTPUT_SIZE` with a
/// truncation marker.
pub fn bound_step_result(step_id: &str, result: Value) -> Value {
    let size = serde_json::to_vec(&result).map(|b| b.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return result;
    }
    tracing::warn!(
        step_id,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step result exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!(
            "output exceeded {} byte limit and was truncated",
            MAX_STEP_OUTPUT_SIZE
        )
    })
}

/// Fail when the serialized context grows beyond `MAX_CONTEXT_SIZE`.
pub fn check_context_size(context: &Map<String, Value>) -> Result<(), WorkflowError> {
    let size = serde_json::to_vec(context)
        .map_err(|e| WorkflowError::Execution(e.to_string()))?
        .len();
    if size > MAX_CONTEXT_SIZE {
        return Err(WorkflowError::Execution(format!(
            "total context size ({size} bytes) exceeds maximum ({MAX_CONTEXT_SIZE} bytes)"
        )));
    }
    Ok(())
}

/// Shallow-merge `overlay` onto `base`; overlay keys win.
pub fn merge_context(
    base: &Map<String, Value>,
    overlay: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn results() -> HashMap<String, Value> {
        let mut r = HashMap::new();
        r.insert(
            "parse".to_string(),
            json!({ "text": "hello", "pages": [ { "n": 1 }, { "n": 2 } ] }),
        );
        r
    }

    #[test]
    fn test_lookup_path_objects_and_arrays() {
        let v = json!({ "a": { "b": [10, { "c": true }] } });
        assert_eq!(lookup_path(&v, "a.b.0"), Some(&json!(10)));
        assert_eq!(lookup_path(&v, "a.b.1.c"), Some(&json!(true)));
        assert_eq!(lookup_path(&v, "a.x"), None);
        assert_eq!(lookup_path(&v, "a.b.9"), None);
        assert_eq!(lookup_path(&v, ""), Some(&v));
    }

    #[test]
    fn test_resolve_context_and_results() {
        let context = ctx(json!({ "user": { "name": "ada" } }));
        let results = results();
        assert_eq!(resolve_source("context.user.name", &context, &results), json!("ada"));
        assert_eq!(resolve_source("context.user", &context, &results), json!({ "name": "ada" }));
        assert_eq!(resolve_source("results.parse.text", &context, &results), json!("hello"));
        assert_eq!(resolve_source("results.parse.pages.1.n", &context, &results), json!(2));
    }

    #[test]
    fn test_missing_paths_resolve_to_null() {
        let context = ctx(json!({}));
        let results = results();
        assert_eq!(resolve_source("context.nothing.here", &context, &results), Value::Null);
        assert_eq!(resolve_source("results.unknown.text", &context, &results), Value::Null);
        assert_eq!(resolve_source("results.parse.missing", &context, &results), Value::Null);
    }

    #[test]
    fn test_other_sources_are_literals() {
        let context = ctx(json!({}));
        assert_eq!(
            resolve_source("summarize briefly", &context, &HashMap::new()),
            json!("summarize briefly")
        );
        assert_eq!(
            resolve_source("contextual", &context, &HashMap::new()),
            json!("contextual")
        );
    }

    #[test]
    fn test_empty_input_mapping_passes_whole_context() {
        let step = StepConfig::new("s", "agent");
        let context = ctx(json!({ "a": 1, "b": 2 }));
        assert_eq!(build_step_input(&step, &context, &HashMap::new()), context);
    }

    #[test]
    fn test_input_mapping_builds_only_mapped_fields() {
        let mut step = StepConfig::new("s", "agent");
        step.input_mapping
            .insert("text".to_string(), "results.parse.text".to_string());
        step.input_mapping
            .insert("lang".to_string(), "context.lang".to_string());
        let context = ctx(json!({ "lang": "en", "secret": "x" }));

        let input = build_step_input(&step, &context, &results());
        assert_eq!(Value::Object(input), json!({ "text": "hello", "lang": "en" }));
    }

    #[test]
    fn test_output_mapping_writes_nested_targets() {
        let mut step = StepConfig::new("s", "agent");
        step.output_mapping
            .insert("doc.summary".to_string(), "summary".to_string());
        step.output_mapping
            .insert("doc.first_page".to_string(), "pages.0".to_string());
        step.output_mapping
            .insert("missing".to_string(), "nope".to_string());
        let mut context = ctx(json!({ "doc": "replaced" }));

        apply_output_mapping(
            &step,
            &json!({ "summary": "short", "pages": ["p1"] }),
            &mut context,
        );
        assert_eq!(
            Value::Object(context),
            json!({ "doc": { "summary": "short", "first_page": "p1" }, "missing": null })
        );
    }

    #[test]
    fn test_empty_output_mapping_merges_nothing() {
        let step = StepConfig::new("s", "agent");
        let mut context = ctx(json!({ "a": 1 }));
        apply_output_mapping(&step, &json!({ "b": 2 }), &mut context);
        assert_eq!(Value::Object(context), json!({ "a": 1 }));
    }

    #[test]
    fn test_oversized_result_truncated() {
        let big = json!({ "blob": "x".repeat(MAX_STEP_OUTPUT_SIZE + 1) });
        let bounded = bound_step_result("s", big);
        assert_eq!(bounded["_truncated"], json!(true));

        let small = json!({ "ok": true });
        assert_eq!(bound_step_result("s", small.clone()), small);
    }

    #[test]
    fn test_context_size_limit() {
        let mut context = Map::new();
        context.insert("small".to_string(), json!("x"));
        assert!(check_context_size(&context).is_ok());
        context.insert("huge".to_string(), json!("x".repeat(MAX_CONTEXT_SIZE)));
        assert!(check_context_size(&context).is_err());
    }

    #[test]
    fn test_merge_context_overlay_wins() {
        let base = ctx(json!({ "a": 1, "b": 1 }));
        let overlay = ctx(json!({ "b": 2, "c": 3 }));
        assert_eq!(
            Value::Object(merge_context(&base, &overlay)),
            json!({ "a": 1, "b": 2, "c": 3 })
        );
    }
}
