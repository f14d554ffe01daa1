//! Optional shared-state lookup consulted by the controller.
//!
//! Some deployments keep cross-execution state (feature flags, tenant
//! config) outside the in-memory `WorkflowContext`. The controller consults
//! this collaborator when present; absence is fully supported.

use std::pin::Pin;

use serde_json::Value;

/// Errors from shared-state lookups.
#[derive(Debug, thiserror::Error)]
pub enum ContextServiceError {
    #[error("context service unavailable: {0}")]
    Unavailable(String),
}

/// Shared-state lookup beyond the in-memory workflow context.
///
/// Uses RPITIT; see `BoxContextService` for dynamic dispatch.
pub trait ContextService: Send + Sync {
    /// Fetch a value by scope and key; `None` means not present.
    fn get(
        &self,
        scope: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Value>, ContextServiceError>> + Send;
}

/// Object-safe version of [`ContextService`] with boxed futures.
pub trait ContextServiceDyn: Send + Sync {
    fn get_boxed<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, ContextServiceError>> + Send + 'a>>;
}

/// Blanket implementation: any `ContextService` is a `ContextServiceDyn`.
impl<T: ContextService> ContextServiceDyn for T {
    fn get_boxed<'a>(
        &'a self,
        scope: &'a str,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, ContextServiceError>> + Send + 'a>>
    {
        Box::pin(self.get(scope, key))
    }
}

/// Type-erased context service for runtime wiring.
pub struct BoxContextService {
    inner: Box<dyn ContextServiceDyn + Send + Sync>,
}

impl BoxContextService {
    /// Wrap a concrete `ContextService` in a type-erased box.
    pub fn new<T: ContextService + 'static>(service: T) -> Self {
        Self {
            inner: Box::new(service),
        }
    }

    /// Fetch a value by scope and key.
    pub async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>, ContextServiceError> {
        self.inner.get_boxed(scope, key).await
    }
}
