//! The component protocol — what a VM hosts.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use ailoy_types::{ComponentError, Value};

/// Ordered frames produced by an iterative component method.
///
/// The VM forwards each item as a `partial` packet and closes the
/// transaction with a `final` packet when the stream ends (or an `error`
/// packet if an item is `Err`).
pub type MethodStream = Pin<Box<dyn Stream<Item = Result<Value, ComponentError>> + Send>>;

/// A long-lived stateful object hosted by the VM, addressed by UUID.
///
/// Lifecycle: constructed by a module factory (`define`), invoked zero or
/// more times (`call_method` / `iter_method`), destroyed (`delete`).
/// Components are not reentrant: the VM serializes methods per component,
/// which is why both methods take `&mut self`.
#[async_trait]
pub trait Component: Send {
    /// Invoke an instant method: exactly one response value.
    async fn call_method(&mut self, method: &str, inputs: Value) -> Result<Value, ComponentError>;

    /// Invoke an iterative method producing a frame stream.
    ///
    /// The returned stream must be `'static`; implementations typically
    /// clone shared inner state into it. The default rejects every method.
    fn iter_method(&mut self, method: &str, _inputs: Value) -> Result<MethodStream, ComponentError> {
        Err(ComponentError::not_found(format!(
            "no iterative method {method}"
        )))
    }
}
