//! Agent errors.

use thiserror::Error;

use ailoy_broker::BrokerError;
use ailoy_mcp::McpError;
use ailoy_tool::ToolError;

/// Errors raised by agent construction and management calls.
///
/// Failures inside a running `query` are not errors to the caller; they
/// surface as `error` events on the stream so the conversation state
/// stays consistent.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AgentError {
    /// A broker or component call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A tool could not be built or registered.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// An MCP operation failed.
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// Duplicate MCP server name.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Unknown MCP server or tool.
    #[error("not found: {0}")]
    NotFound(String),
}
