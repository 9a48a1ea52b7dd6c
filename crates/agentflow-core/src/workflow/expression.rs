//! JEXL evaluation of transition conditions.
//!
//! Conditions are evaluated against `{ "context": <execution context>,
//! "results": <step results> }`, e.g.
//! `results.classify.intent == 'question' && context.priority > 2`.
//!
//! Values are always passed as the evaluation context, never interpolated into
//! expression strings.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL evaluator with the transforms conditions commonly need.
///
/// Not `Send`; build one where it is used rather than holding it across
/// `.await` points.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => {
                        s.contains(needle.as_str())
                    }
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            });

        Self { evaluator }
    }

    /// Evaluate an expression against a JSON object, coercing the result with
    /// JavaScript-like truthiness.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(truthy(&result))
    }

    /// Evaluate a transition condition against an execution's state.
    pub fn evaluate_condition(
        &self,
        expression: &str,
        context: &Map<String, Value>,
        results: &HashMap<String, Value>,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, &condition_scope(context, results))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// The object conditions are evaluated against.
pub fn condition_scope(context: &Map<String, Value>, results: &HashMap<String, Value>) -> Value {
    json!({
        "context": context,
        "results": results,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (Map<String, Value>, HashMap<String, Value>) {
        let context = json!({ "priority": 3, "customer": { "tier": "Gold" } })
            .as_object()
            .cloned()
            .unwrap();
        let mut results = HashMap::new();
        results.insert(
            "classify".to_string(),
            json!({ "intent": "question", "tags": ["billing", "urgent"] }),
        );
        (context, results)
    }

    #[test]
    fn test_condition_over_results_and_context() {
        let (context, results) = state();
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_condition(
                "results.classify.intent == 'question' && context.priority > 2",
                &context,
                &results
            )
            .unwrap());
        assert!(!eval
            .evaluate_condition("results.classify.intent == 'complaint'", &context, &results)
            .unwrap());
    }

    #[test]
    fn test_transforms() {
        let (context, results) = state();
        let eval = ConditionEvaluator::new();
        assert!(eval
            .evaluate_condition("context.customer.tier|lower == 'gold'", &context, &results)
            .unwrap());
        assert!(eval
            .evaluate_condition("results.classify.tags|contains('urgent')", &context, &results)
            .unwrap());
        assert!(eval
            .evaluate_condition("results.classify.tags|length == 2", &context, &results)
            .unwrap());
    }

    #[test]
    fn test_missing_value_is_falsy() {
        let (context, results) = state();
        let eval = ConditionEvaluator::new();
        assert!(!eval
            .evaluate_condition("context.missing", &context, &results)
            .unwrap());
    }

    #[test]
    fn test_invalid_expression_errors() {
        let (context, results) = state();
        let eval = ConditionEvaluator::new();
        let err = eval
            .evaluate_condition("results.classify.intent ==", &context, &results)
            .unwrap_err();
        assert!(matches!(err, ExpressionError::EvalFailed { .. }));
    }

    #[test]
    fn test_non_object_context_rejected() {
        let eval = ConditionEvaluator::new();
        assert!(matches!(
            eval.evaluate_bool("true", &json!(1)),
            Err(ExpressionError::InvalidContext(_))
        ));
    }
}
