#![deny(missing_docs)]
//! # ailoy — umbrella crate
//!
//! Single import surface for the ailoy agentic-LLM runtime. Re-exports
//! the component crates behind feature flags, plus a `prelude` for the
//! happy path and [`runtime`] for the process-wide broker/VM bootstrap.

pub use ailoy_types;

#[cfg(feature = "agent")]
pub use ailoy_agent;
#[cfg(feature = "core")]
pub use ailoy_broker;
#[cfg(feature = "cache")]
pub use ailoy_cache;
#[cfg(feature = "embed")]
pub use ailoy_embed;
#[cfg(feature = "engine")]
pub use ailoy_engine;
#[cfg(feature = "mcp")]
pub use ailoy_mcp;
#[cfg(feature = "provider-openai")]
pub use ailoy_provider_openai;
#[cfg(feature = "tool")]
pub use ailoy_tool;
#[cfg(feature = "core")]
pub use ailoy_vm;

#[cfg(feature = "core")]
pub mod runtime;

/// Happy-path imports for embedding the runtime.
pub mod prelude {
    pub use ailoy_types::{
        ComponentError, ErrorKind, FinishReason, Message, MessageContent, MessageOutput, Part,
        Role, ToolCall, ToolDesc, Value,
    };

    #[cfg(feature = "agent")]
    pub use ailoy_agent::{Agent, AgentResponse, AgentResponseContent, ModelSpec, QueryOptions};

    #[cfg(feature = "core")]
    pub use ailoy_broker::Runtime;

    #[cfg(feature = "cache")]
    pub use ailoy_cache::{ModelCache, TargetDevice};

    #[cfg(feature = "engine")]
    pub use ailoy_engine::{BackendLoader, LocalEngine};

    #[cfg(feature = "provider-openai")]
    pub use ailoy_provider_openai::{ApiProvider, RemoteEngine};

    #[cfg(feature = "tool")]
    pub use ailoy_tool::{Tool, ToolRegistry};

    #[cfg(feature = "mcp")]
    pub use ailoy_mcp::McpClient;

    #[cfg(feature = "core")]
    pub use ailoy_vm::ModuleRegistry;

    #[cfg(feature = "core")]
    pub use crate::runtime::{RuntimeBuilder, RuntimeHandle};
}
