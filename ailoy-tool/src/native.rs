//! Tools backed by native async closures.

use std::future::Future;
use std::sync::Arc;

use ailoy_types::{ToolDesc, Value};

use crate::{Tool, ToolError, ToolFuture};

type NativeFn = Arc<dyn Fn(Value) -> ToolFuture<'static> + Send + Sync>;

/// A tool implemented by a host-provided async function.
pub struct NativeTool {
    desc: ToolDesc,
    function: NativeFn,
}

impl NativeTool {
    /// Wrap an async closure as a tool.
    pub fn new<F, Fut>(desc: ToolDesc, function: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            desc,
            function: Arc::new(move |input| Box::pin(function(input))),
        }
    }
}

impl Tool for NativeTool {
    fn desc(&self) -> ToolDesc {
        self.desc.clone()
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        (self.function)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn native_tool_runs_its_closure() {
        let tool = NativeTool::new(
            ToolDesc {
                name: "add".into(),
                description: "adds two ints".into(),
                parameters: Value::from_json(r#"{"type":"object","properties":{}}"#).unwrap(),
                returns: None,
            },
            |input| async move {
                let a = input.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = input.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(a + b))
            },
        );
        let out = tool
            .call(Value::map([("a", Value::Int(3)), ("b", Value::Int(4))]))
            .await
            .unwrap();
        assert_eq!(out, Value::Int(7));
    }
}
