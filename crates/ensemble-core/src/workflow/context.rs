//! Per-execution workflow state: variables, step outputs, step statuses.
//!
//! `WorkflowContext` is pure data plus accessors -- no I/O. It is mutated
//! only by the engine's level-coordinating task, so it carries no internal
//! locking even when sibling steps run concurrently.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ensemble_types::execution::StepStatus;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Output references
// ---------------------------------------------------------------------------

/// A parsed `steps.<id>.<field>` reference.
///
/// This is the whole grammar: the literal prefix `steps.`, a step id up to
/// the next dot, and the field key (the remainder, looked up verbatim).
/// Anything else is not a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRef<'a> {
    pub step_id: &'a str,
    pub field: &'a str,
}

impl<'a> OutputRef<'a> {
    /// Parse a reference string, returning `None` for non-references.
    pub fn parse(raw: &'a str) -> Option<Self> {
        let rest = raw.strip_prefix("steps.")?;
        let (step_id, field) = rest.split_once('.')?;
        if step_id.is_empty() || field.is_empty() {
            return None;
        }
        Some(Self { step_id, field })
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable execution state that tracks variables, step outputs, and step
/// statuses across one workflow execution.
///
/// Created at execution start, mutated only by the engine as steps settle,
/// and discarded at execution end (its final state already persisted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// The execution this context belongs to.
    pub execution_id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    /// User-supplied variables, seeded from the definition defaults overlaid
    /// with per-execution input.
    pub variables: HashMap<String, Value>,
    /// Step outputs keyed by step ID; each output is a map of named fields.
    pub step_outputs: HashMap<String, HashMap<String, Value>>,
    /// Per-step statuses keyed by step ID.
    pub step_statuses: HashMap<String, StepStatus>,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
}

impl WorkflowContext {
    /// Create a new context for an execution, seeded with input variables.
    pub fn new(
        execution_id: Uuid,
        workspace_id: Uuid,
        project_id: Uuid,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            execution_id,
            workspace_id,
            project_id,
            variables,
            step_outputs: HashMap::new(),
            step_statuses: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Read an input value for a step.
    ///
    /// Looks up `key` in `variables`; if the stored value is a reference
    /// string `steps.<id>.<field>`, it resolves to that field of the
    /// referenced step's output. Missing keys and unresolvable references
    /// return `default`.
    pub fn get_step_input(&self, step_id: &str, key: &str, default: Value) -> Value {
        let Some(raw) = self.variables.get(key) else {
            tracing::trace!(step_id, key, "input key missing, using default");
            return default;
        };
        match raw.as_str().and_then(OutputRef::parse) {
            Some(reference) => self
                .resolve_ref(reference)
                .cloned()
                .unwrap_or(default),
            None => raw.clone(),
        }
    }

    /// Resolve a parsed output reference against accumulated step outputs.
    pub fn resolve_ref(&self, reference: OutputRef<'_>) -> Option<&Value> {
        self.step_outputs
            .get(reference.step_id)?
            .get(reference.field)
    }

    /// Materialize a step input map: reference strings resolve to the output
    /// value they point at, unresolvable references become `null`, everything
    /// else passes through unchanged.
    pub fn resolve_input(&self, input: &HashMap<String, Value>) -> HashMap<String, Value> {
        input
            .iter()
            .map(|(k, v)| {
                let resolved = match v.as_str().and_then(OutputRef::parse) {
                    Some(reference) => self.resolve_ref(reference).cloned().unwrap_or(Value::Null),
                    None => v.clone(),
                };
                (k.clone(), resolved)
            })
            .collect()
    }

    /// Store the output of a completed step and mark it `Completed`.
    ///
    /// The first write wins: once a step is terminal its output can no
    /// longer change.
    pub fn set_step_output(
        &mut self,
        step_id: &str,
        output: HashMap<String, Value>,
    ) -> Result<(), WorkflowError> {
        if self.step_status(step_id).is_terminal() {
            return Err(WorkflowError::ExecutionError(format!(
                "step '{step_id}' is already terminal, output rejected"
            )));
        }
        self.step_outputs.insert(step_id.to_string(), output);
        self.step_statuses
            .insert(step_id.to_string(), StepStatus::Completed);
        Ok(())
    }

    /// Get the full output map of a step, if it has completed.
    pub fn get_step_output(&self, step_id: &str) -> Option<&HashMap<String, Value>> {
        self.step_outputs.get(step_id)
    }

    /// Set a step's status directly (Running, Failed, Skipped, ...).
    pub fn set_step_status(&mut self, step_id: &str, status: StepStatus) {
        self.step_statuses.insert(step_id.to_string(), status);
    }

    /// Current status of a step; steps never dispatched are `Pending`.
    pub fn step_status(&self, step_id: &str) -> StepStatus {
        self.step_statuses
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending)
    }

    /// Whether any step has reached `Failed`.
    pub fn any_step_failed(&self) -> bool {
        self.step_statuses
            .values()
            .any(|s| *s == StepStatus::Failed)
    }

    /// Build the JSON object consumed by the JEXL condition evaluator.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "steps": { "<step_id>": { "<field>": <value>, ... }, ... },
    ///   "variables": { ... },
    ///   "execution": { "id": "...", "workspace_id": "...", "project_id": "..." }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        json!({
            "steps": self.step_outputs,
            "variables": self.variables,
            "execution": {
                "id": self.execution_id.to_string(),
                "workspace_id": self.workspace_id.to_string(),
                "project_id": self.project_id.to_string(),
            }
        })
    }

    /// Serialize the entire context to JSON for the execution record.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Restore a context from a persisted JSON snapshot.
    pub fn from_json(value: Value) -> Result<Self, WorkflowError> {
        serde_json::from_value(value)
            .map_err(|e| WorkflowError::ParseError(format!("failed to restore context: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> WorkflowContext {
        WorkflowContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            HashMap::from([
                ("topic".to_string(), json!("ai news")),
                ("body".to_string(), json!("steps.gather.result")),
            ]),
        )
    }

    // -----------------------------------------------------------------------
    // OutputRef grammar
    // -----------------------------------------------------------------------

    #[test]
    fn test_output_ref_parse_valid() {
        let r = OutputRef::parse("steps.gather.result").unwrap();
        assert_eq!(r.step_id, "gather");
        assert_eq!(r.field, "result");
    }

    #[test]
    fn test_output_ref_field_keeps_remainder() {
        let r = OutputRef::parse("steps.gather.result.count").unwrap();
        assert_eq!(r.step_id, "gather");
        assert_eq!(r.field, "result.count");
    }

    #[test]
    fn test_output_ref_rejects_non_references() {
        assert!(OutputRef::parse("plain string").is_none());
        assert!(OutputRef::parse("steps.").is_none());
        assert!(OutputRef::parse("steps.gather").is_none());
        assert!(OutputRef::parse("steps..field").is_none());
        assert!(OutputRef::parse("step.gather.result").is_none());
    }

    // -----------------------------------------------------------------------
    // Input resolution
    // -----------------------------------------------------------------------

    #[test]
    fn test_get_step_input_plain_variable() {
        let ctx = test_context();
        assert_eq!(
            ctx.get_step_input("any", "topic", json!("fallback")),
            json!("ai news")
        );
    }

    #[test]
    fn test_get_step_input_missing_key_returns_default() {
        let ctx = test_context();
        assert_eq!(
            ctx.get_step_input("any", "missing", json!("fallback")),
            json!("fallback")
        );
    }

    #[test]
    fn test_get_step_input_resolves_reference() {
        let mut ctx = test_context();
        ctx.set_step_output(
            "gather",
            HashMap::from([("result".to_string(), json!("five articles"))]),
        )
        .unwrap();

        assert_eq!(
            ctx.get_step_input("summarize", "body", json!("fallback")),
            json!("five articles")
        );
    }

    #[test]
    fn test_get_step_input_incomplete_step_returns_default() {
        let ctx = test_context();
        // "gather" has not produced output yet
        assert_eq!(
            ctx.get_step_input("summarize", "body", json!("fallback")),
            json!("fallback")
        );
    }

    #[test]
    fn test_resolve_input_map() {
        let mut ctx = test_context();
        ctx.set_step_output(
            "gather",
            HashMap::from([("result".to_string(), json!(["a", "b"]))]),
        )
        .unwrap();

        let input = HashMap::from([
            ("articles".to_string(), json!("steps.gather.result")),
            ("broken".to_string(), json!("steps.gather.nope")),
            ("literal".to_string(), json!(42)),
        ]);
        let resolved = ctx.resolve_input(&input);
        assert_eq!(resolved["articles"], json!(["a", "b"]));
        assert_eq!(resolved["broken"], Value::Null);
        assert_eq!(resolved["literal"], json!(42));
    }

    // -----------------------------------------------------------------------
    // Output and status tracking
    // -----------------------------------------------------------------------

    #[test]
    fn test_set_step_output_marks_completed() {
        let mut ctx = test_context();
        ctx.set_step_output(
            "gather",
            HashMap::from([("result".to_string(), json!("ok"))]),
        )
        .unwrap();

        assert_eq!(ctx.step_status("gather"), StepStatus::Completed);
        assert!(ctx.get_step_output("gather").is_some());
    }

    #[test]
    fn test_set_step_output_rejected_when_terminal() {
        let mut ctx = test_context();
        ctx.set_step_status("gather", StepStatus::Failed);
        let err = ctx
            .set_step_output("gather", HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("already terminal"));
    }

    #[test]
    fn test_step_status_defaults_to_pending() {
        let ctx = test_context();
        assert_eq!(ctx.step_status("never-seen"), StepStatus::Pending);
    }

    #[test]
    fn test_any_step_failed() {
        let mut ctx = test_context();
        assert!(!ctx.any_step_failed());
        ctx.set_step_status("gather", StepStatus::Failed);
        assert!(ctx.any_step_failed());
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    #[test]
    fn test_json_snapshot_roundtrip() {
        let mut ctx = test_context();
        ctx.set_step_output(
            "gather",
            HashMap::from([("result".to_string(), json!("news"))]),
        )
        .unwrap();
        ctx.set_step_status("publish", StepStatus::Skipped);

        let snapshot = ctx.to_json();
        let restored = WorkflowContext::from_json(snapshot).unwrap();
        assert_eq!(restored.execution_id, ctx.execution_id);
        assert_eq!(restored.step_status("publish"), StepStatus::Skipped);
        assert_eq!(
            restored.get_step_output("gather").unwrap()["result"],
            json!("news")
        );
    }

    #[test]
    fn test_expression_context_shape() {
        let mut ctx = test_context();
        ctx.set_step_output(
            "gather",
            HashMap::from([("count".to_string(), json!(5))]),
        )
        .unwrap();

        let expr = ctx.to_expression_context();
        assert_eq!(expr["steps"]["gather"]["count"], json!(5));
        assert_eq!(expr["variables"]["topic"], json!("ai news"));
        assert_eq!(
            expr["execution"]["id"],
            json!(ctx.execution_id.to_string())
        );
    }
}
