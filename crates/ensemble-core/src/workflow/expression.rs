//! JEXL expression evaluator for CONDITION steps.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of pre-registered
//! transforms and provides boolean evaluation against a workflow context.
//!
//! **Security note:** context data is always passed as a context object,
//! NEVER interpolated into expression strings.

use serde_json::{Value, json};

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator for CONDITION step expressions
/// (e.g. `steps.gather.count > 0`).
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    /// Create a new evaluator with the standard transforms registered.
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
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!Self::value_to_bool(&val)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Results are coerced to boolean
    /// using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(Self::value_to_bool(&result))
    }

    /// Evaluate an expression against a workflow context.
    pub fn evaluate_in_workflow_context(
        &self,
        expression: &str,
        workflow_context: &WorkflowContext,
    ) -> Result<bool, ExpressionError> {
        let context = workflow_context.to_expression_context();
        self.evaluate_bool(expression, &context)
    }

    /// JavaScript-like truthiness coercion.
    fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use uuid::Uuid;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    #[test]
    fn test_simple_comparison() {
        let ctx = json!({ "count": 5 });
        assert!(evaluator().evaluate_bool("count > 3", &ctx).unwrap());
        assert!(!evaluator().evaluate_bool("count > 10", &ctx).unwrap());
    }

    #[test]
    fn test_string_equality() {
        let ctx = json!({ "source": "github" });
        assert!(
            evaluator()
                .evaluate_bool("source == 'github'", &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({ "name": "Gather" });
        assert!(
            evaluator()
                .evaluate_bool("name|lower == 'gather'", &ctx)
                .unwrap()
        );
        assert!(
            evaluator()
                .evaluate_bool("name|contains('ath')", &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_length_transform() {
        let ctx = json!({ "items": [1, 2, 3] });
        assert!(
            evaluator()
                .evaluate_bool("items|length > 2", &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_invalid_context_rejected() {
        let err = evaluator()
            .evaluate_bool("1 == 1", &json!("not an object"))
            .unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidContext(_)));
    }

    #[test]
    fn test_evaluate_in_workflow_context() {
        let mut ctx = WorkflowContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            HashMap::new(),
        );
        ctx.set_step_output(
            "gather",
            HashMap::from([("count".to_string(), json!(5))]),
        )
        .unwrap();

        assert!(
            evaluator()
                .evaluate_in_workflow_context("steps.gather.count > 0", &ctx)
                .unwrap()
        );
        assert!(
            !evaluator()
                .evaluate_in_workflow_context("steps.gather.count > 9", &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_truthiness_coercion() {
        let ctx = json!({ "empty": "", "full": "text" });
        assert!(!evaluator().evaluate_bool("empty", &ctx).unwrap());
        assert!(evaluator().evaluate_bool("full", &ctx).unwrap());
    }
}
