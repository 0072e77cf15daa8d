//! # ailoy-tool — the tool subsystem
//!
//! Tools are what an agent can call: native async functions, templated
//! REST requests, VM builtin operators, or (via `ailoy-mcp`) remote MCP
//! tools. The registry enforces unique names; REST and builtin tools
//! dispatch through the runtime's `http_request` operator and reduce
//! their payloads with a JMESPath projection.

#![deny(missing_docs)]

pub mod jmespath;
pub mod native;
pub mod preset;
pub mod registry;
pub mod rest;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use ailoy_types::{ComponentError, ErrorKind, ToolDesc, Value};

pub use native::NativeTool;
pub use preset::load_preset;
pub use registry::ToolRegistry;
pub use rest::{Authenticator, BuiltinTool, HttpRequestParts, RestApiTool, bearer_authenticator,
    query_param_authenticator};

/// Errors raised by tool lookup and execution.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// No tool registered under the name.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The inputs violate the tool's schema.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The tool ran and failed.
    #[error("tool execution failed: {0}")]
    Execution(String),

    /// A JMESPath output projection failed to parse or apply.
    #[error("output path error: {0}")]
    OutputPath(String),

    /// A runtime-dispatched call failed below the tool layer.
    #[error(transparent)]
    Component(#[from] ComponentError),
}

impl From<ToolError> for ComponentError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Component(inner) => inner,
            ToolError::NotFound(message) => ComponentError::not_found(message),
            ToolError::InvalidInput(message) => ComponentError::validation(message),
            other => ComponentError::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

/// Future type returned by [`Tool::call`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// A callable tool.
///
/// Implementations are type-erased trait objects so native closures, REST
/// templates, and MCP bridges can share one registry.
pub trait Tool: Send + Sync {
    /// The descriptor shown to the model.
    fn desc(&self) -> ToolDesc;

    /// Execute with already-validated inputs.
    fn call(&self, input: Value) -> ToolFuture<'_>;
}

/// Check `input` against the descriptor's `required` list.
pub fn validate_required(desc: &ToolDesc, input: &Value) -> Result<(), ToolError> {
    for name in desc.required_parameters() {
        let present = input.get(name).map(|v| !v.is_null()).unwrap_or(false);
        if !present {
            return Err(ToolError::InvalidInput(format!(
                "missing required parameter {name} for tool {}",
                desc.name
            )));
        }
    }
    Ok(())
}
