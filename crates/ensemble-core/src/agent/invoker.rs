//! Agent invoker -- the opaque unit of work behind AGENT steps.
//!
//! The controller reserves an instance, then awaits the invoker against it.
//! What "invoking an agent" actually means (an LLM call, a remote worker,
//! a subprocess) lives outside this crate. Follows the Box*Dyn blanket-impl
//! pattern for dyn-safe async traits.

use std::collections::HashMap;
use std::pin::Pin;

use ensemble_types::agent::AgentInstance;
use ensemble_types::workflow::StepDefinition;
use serde_json::Value;

/// Errors from agent invocation.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("agent invocation failed: {0}")]
    Failed(String),

    #[error("agent instance unavailable: {0}")]
    Unavailable(String),
}

/// The awaitable unit of work an AGENT step runs on its reserved instance.
///
/// Uses RPITIT; see `BoxAgentInvoker` for dynamic dispatch.
pub trait AgentInvoker: Send + Sync {
    /// Run the step's task on `instance` with resolved `input`, returning an
    /// output map.
    fn invoke(
        &self,
        instance: &AgentInstance,
        step: &StepDefinition,
        input: &HashMap<String, Value>,
    ) -> impl Future<Output = Result<HashMap<String, Value>, InvokeError>> + Send;
}

/// Object-safe version of [`AgentInvoker`] with boxed futures.
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        instance: &'a AgentInstance,
        step: &'a StepDefinition,
        input: &'a HashMap<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, InvokeError>> + Send + 'a>>;
}

/// Blanket implementation: any `AgentInvoker` is an `AgentInvokerDyn`.
impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        instance: &'a AgentInstance,
        step: &'a StepDefinition,
        input: &'a HashMap<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, InvokeError>> + Send + 'a>>
    {
        Box::pin(self.invoke(instance, step, input))
    }
}

/// Type-erased agent invoker for runtime wiring.
pub struct BoxAgentInvoker {
    inner: Box<dyn AgentInvokerDyn + Send + Sync>,
}

impl BoxAgentInvoker {
    /// Wrap a concrete `AgentInvoker` in a type-erased box.
    pub fn new<T: AgentInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }

    /// Invoke the agent's unit of work.
    pub async fn invoke(
        &self,
        instance: &AgentInstance,
        step: &StepDefinition,
        input: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>, InvokeError> {
        self.inner.invoke_boxed(instance, step, input).await
    }
}
