//! Tool registry: register, look up, execute.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use ailoy_types::{ToolDesc, Value};

use crate::{Tool, ToolError, validate_required};

/// Registry of tools, keyed by unique name, in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns `false` (leaving the registry unchanged)
    /// when a tool with the same name already exists.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.desc().name;
        if self.tools.contains_key(&name) {
            return false;
        }
        self.tools.insert(name, tool);
        true
    }

    /// Look up a tool by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors of every registered tool, in registration order.
    pub fn descriptors(&self) -> Vec<ToolDesc> {
        self.tools.values().map(|t| t.desc()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Remove one tool by name.
    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.shift_remove(name).is_some()
    }

    /// Remove every tool whose name starts with `prefix` (used to detach
    /// an MCP server's tool set). Returns how many were removed.
    pub fn remove_by_prefix(&mut self, prefix: &str) -> usize {
        let before = self.tools.len();
        self.tools.retain(|name, _| !name.starts_with(prefix));
        before - self.tools.len()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.tools.clear();
    }

    /// Execute a tool by exact name, validating required parameters
    /// first.
    pub async fn execute(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_owned()))?;
        validate_required(&tool.desc(), &input)?;
        debug!(tool = name, "executing tool");
        tool.call(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NativeTool;

    fn echo_tool(name: &str) -> Arc<dyn Tool> {
        Arc::new(NativeTool::new(
            ToolDesc {
                name: name.into(),
                description: "echoes".into(),
                parameters: Value::from_json(r#"{"type":"object","properties":{}}"#).unwrap(),
                returns: None,
            },
            |input| async move { Ok(input) },
        ))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(echo_tool("echo")));
        assert!(!registry.register(echo_tool("echo")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_by_prefix_detaches_server_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("files-read"));
        registry.register(echo_tool("files-write"));
        registry.register(echo_tool("math-add"));
        assert_eq!(registry.remove_by_prefix("files-"), 2);
        assert_eq!(registry.descriptors().len(), 1);
        assert_eq!(registry.descriptors()[0].name, "math-add");
    }

    #[tokio::test]
    async fn execute_unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn execute_runs_the_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool("echo"));
        let input = Value::map([("x", Value::Int(1))]);
        let out = registry.execute("echo", input.clone()).await.unwrap();
        assert_eq!(out, input);
    }
}
