//! Action executor -- the opaque unit of work behind TASK steps.
//!
//! The engine does not know what an action does; it awaits the executor and
//! stores whatever output map comes back. Follows the Box*Dyn blanket-impl
//! pattern used throughout this codebase for dyn-safe async traits:
//! 1. Define an object-safe `ActionExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `ActionExecutorDyn` for all `T: ActionExecutor`
//! 3. `BoxActionExecutor` wraps `Box<dyn ActionExecutorDyn>` and delegates

use std::collections::HashMap;
use std::pin::Pin;

use serde_json::Value;

use super::context::WorkflowContext;

/// Errors from TASK action execution.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action failed: {0}")]
    Failed(String),
}

/// The awaitable unit of work a TASK step delegates to.
///
/// Uses RPITIT; see `BoxActionExecutor` for dynamic dispatch.
pub trait ActionExecutor: Send + Sync {
    /// Execute `action` with resolved `params`, returning an output map.
    fn execute(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
        ctx: &WorkflowContext,
    ) -> impl Future<Output = Result<HashMap<String, Value>, ActionError>> + Send;
}

/// Object-safe version of [`ActionExecutor`] with boxed futures.
pub trait ActionExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        action: &'a str,
        params: &'a HashMap<String, Value>,
        ctx: &'a WorkflowContext,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, ActionError>> + Send + 'a>>;
}

/// Blanket implementation: any `ActionExecutor` is an `ActionExecutorDyn`.
impl<T: ActionExecutor> ActionExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        action: &'a str,
        params: &'a HashMap<String, Value>,
        ctx: &'a WorkflowContext,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, ActionError>> + Send + 'a>>
    {
        Box::pin(self.execute(action, params, ctx))
    }
}

/// Type-erased action executor for runtime wiring.
pub struct BoxActionExecutor {
    inner: Box<dyn ActionExecutorDyn + Send + Sync>,
}

impl BoxActionExecutor {
    /// Wrap a concrete `ActionExecutor` in a type-erased box.
    pub fn new<T: ActionExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    /// Execute an action against the given context.
    pub async fn execute(
        &self,
        action: &str,
        params: &HashMap<String, Value>,
        ctx: &WorkflowContext,
    ) -> Result<HashMap<String, Value>, ActionError> {
        self.inner.execute_boxed(action, params, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    struct EchoExecutor;

    impl ActionExecutor for EchoExecutor {
        async fn execute(
            &self,
            action: &str,
            params: &HashMap<String, Value>,
            _ctx: &WorkflowContext,
        ) -> Result<HashMap<String, Value>, ActionError> {
            if action == "boom" {
                return Err(ActionError::Failed("exploded".to_string()));
            }
            let mut output = params.clone();
            output.insert("action".to_string(), json!(action));
            Ok(output)
        }
    }

    fn test_ctx() -> WorkflowContext {
        WorkflowContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn boxed_executor_delegates() {
        let executor = BoxActionExecutor::new(EchoExecutor);
        let params = HashMap::from([("k".to_string(), json!("v"))]);
        let output = executor
            .execute("echo", &params, &test_ctx())
            .await
            .unwrap();
        assert_eq!(output["action"], json!("echo"));
        assert_eq!(output["k"], json!("v"));
    }

    #[tokio::test]
    async fn boxed_executor_propagates_errors() {
        let executor = BoxActionExecutor::new(EchoExecutor);
        let err = executor
            .execute("boom", &HashMap::new(), &test_ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Failed(_)));
    }
}
