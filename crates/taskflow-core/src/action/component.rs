//! ComponentAction trait and its object-safe wrapper.
//!
//! Actor clients implement `ComponentAction` with native async fn in traits.
//! The registry stores them as `BoxComponentAction`, which erases the type
//! through `ComponentActionDyn` (boxed futures) and a blanket impl.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use taskflow_types::workflow::TaskError;

/// An external actor that can run named actions.
///
/// Must be safe to call concurrently: one instance serves every execution.
/// Implementations classify their own failures into `ErrorKind`s; the
/// engine never invents task-level error kinds.
pub trait ComponentAction: Send + Sync {
    fn invoke(
        &self,
        action: &str,
        input: Value,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe mirror of [`ComponentAction`].
pub trait ComponentActionDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>>;
}

impl<T: ComponentAction> ComponentActionDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        input: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>> {
        Box::pin(self.invoke(action, input))
    }
}

pub struct BoxComponentAction {
    inner: Box<dyn ComponentActionDyn>,
}

impl BoxComponentAction {
    pub fn new<T: ComponentAction + 'static>(component: T) -> Self {
        Self {
            inner: Box::new(component),
        }
    }

    pub async fn invoke(&self, action: &str, input: Value) -> Result<Value, TaskError> {
        self.inner.invoke_boxed(action, input).await
    }
}

impl std::fmt::Debug for BoxComponentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxComponentAction").finish_non_exhaustive()
    }
}
