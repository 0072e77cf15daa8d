//! # ailoy-mcp — MCP client adapter
//!
//! Connects to Model Context Protocol servers (stdio child process or
//! streamable HTTP), discovers their tools, and exposes each as an
//! [`ailoy_tool::Tool`] named `<server>-<tool>` so agents can register
//! remote tools next to native ones.

#![deny(missing_docs)]

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::ServiceExt;
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, RawContent};
use rmcp::service::{Peer, RoleClient, RunningService};
use rmcp::transport::child_process::TokioChildProcess;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransport;
use thiserror::Error;
use tracing::debug;

use ailoy_tool::{Tool, ToolError, ToolFuture};
use ailoy_types::{ComponentError, ErrorKind, ToolDesc, Value};

/// MCP connection and protocol errors.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum McpError {
    /// Connecting or handshaking failed.
    #[error("mcp connection failed: {0}")]
    Connection(String),

    /// A protocol request failed after connecting.
    #[error("mcp protocol error: {0}")]
    Protocol(String),
}

impl From<McpError> for ComponentError {
    fn from(err: McpError) -> Self {
        ComponentError::new(ErrorKind::Io, err.to_string())
    }
}

/// A connected MCP client, labeled with the server name used to prefix
/// its tools.
pub struct McpClient {
    name: String,
    service: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// Connect by spawning an MCP server as a child process.
    ///
    /// # Errors
    ///
    /// [`McpError::Connection`] when the process cannot be spawned or the
    /// handshake fails.
    pub async fn connect_stdio(
        name: impl Into<String>,
        command: tokio::process::Command,
    ) -> Result<Self, McpError> {
        let transport =
            TokioChildProcess::new(command).map_err(|e| McpError::Connection(e.to_string()))?;
        let service = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            service,
        })
    }

    /// Connect to an MCP server over streamable HTTP.
    pub async fn connect_http(
        name: impl Into<String>,
        url: &str,
    ) -> Result<Self, McpError> {
        let transport = StreamableHttpClientTransport::from_uri(url);
        let service: RunningService<RoleClient, ()> = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            service,
        })
    }

    /// The server name; also the prefix of every adapted tool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Discover the server's tools as registry-ready [`Tool`]s, each
    /// named `<server>-<tool>`.
    pub async fn tools(&self) -> Result<Vec<Arc<dyn Tool>>, McpError> {
        let listed = self
            .service
            .list_all_tools()
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        debug!(server = %self.name, count = listed.len(), "discovered mcp tools");

        let peer = Arc::new(self.service.peer().clone());
        Ok(listed
            .into_iter()
            .map(|tool| {
                Arc::new(McpTool::new(&self.name, tool, Arc::clone(&peer))) as Arc<dyn Tool>
            })
            .collect())
    }

    /// Shut down the connection.
    pub async fn close(self) -> Result<(), McpError> {
        self.service
            .cancel()
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// One remote MCP tool adapted to the [`Tool`] trait.
pub struct McpTool {
    desc: ToolDesc,
    remote_name: Cow<'static, str>,
    peer: Arc<Peer<RoleClient>>,
}

impl McpTool {
    fn new(server: &str, tool: rmcp::model::Tool, peer: Arc<Peer<RoleClient>>) -> Self {
        let parameters = serde_json::to_value(&*tool.input_schema)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from_json(r#"{"type":"object"}"#).unwrap_or_default());
        let desc = ToolDesc {
            name: format!("{server}-{}", tool.name),
            description: tool.description.as_deref().unwrap_or("").to_owned(),
            parameters,
            returns: None,
        };
        Self {
            desc,
            remote_name: tool.name,
            peer,
        }
    }
}

impl Tool for McpTool {
    fn desc(&self) -> ToolDesc {
        self.desc.clone()
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let arguments = match serde_json::Value::from(&input) {
                serde_json::Value::Object(map) => Some(map),
                serde_json::Value::Null => None,
                other => {
                    return Err(ToolError::InvalidInput(format!(
                        "expected object or null arguments, got {other}"
                    )));
                }
            };
            let params = CallToolRequestParams {
                meta: None,
                name: self.remote_name.clone(),
                arguments,
                task: None,
            };

            let result: CallToolResult = self
                .peer
                .call_tool(params)
                .await
                .map_err(|e| ToolError::Execution(e.to_string()))?;

            if result.is_error == Some(true) {
                return Err(ToolError::Execution(extract_text(&result.content)));
            }
            if let Some(structured) = result.structured_content {
                return Ok(Value::from(structured));
            }
            Ok(content_to_value(&result.content))
        })
    }
}

/// Map MCP content parts into a value: a bare string for text-only
/// results, else an array of typed parts.
fn content_to_value(content: &[Content]) -> Value {
    let only_text = content
        .iter()
        .all(|c| matches!(&c.raw, RawContent::Text(_)));
    if only_text {
        return Value::Str(extract_text(content));
    }
    Value::Array(
        content
            .iter()
            .map(|c| match &c.raw {
                RawContent::Text(t) => Value::map([
                    ("type", Value::from("text")),
                    ("text", Value::from(t.text.as_str())),
                ]),
                RawContent::Image(image) => Value::map([
                    ("type", Value::from("image")),
                    ("data", Value::from(image.data.as_str())),
                    ("mime_type", Value::from(image.mime_type.as_str())),
                ]),
                other => serde_json::to_value(other)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            })
            .collect(),
    )
}

fn extract_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_content(text: &str) -> Content {
        serde_json::from_value(serde_json::json!({"type": "text", "text": text}))
            .expect("text content deserializes")
    }

    #[test]
    fn text_only_content_collapses_to_string() {
        let value = content_to_value(&[text_content("hello"), text_content("world")]);
        assert_eq!(value.as_str(), Some("hello\nworld"));
    }

    #[test]
    fn tool_names_are_server_prefixed() {
        let schema = serde_json::json!({"type": "object"});
        let tool = rmcp::model::Tool {
            name: Cow::Borrowed("read_file"),
            title: None,
            description: Some(Cow::Borrowed("Reads a file")),
            input_schema: Arc::new(schema.as_object().unwrap().clone()),
            output_schema: None,
            annotations: None,
            execution: None,
            icons: None,
            meta: None,
        };
        // Building the descriptor does not need a live peer; reuse the
        // conversion directly.
        let parameters = serde_json::to_value(&*tool.input_schema)
            .map(Value::from)
            .unwrap();
        let desc = ToolDesc {
            name: format!("files-{}", tool.name),
            description: tool.description.as_deref().unwrap_or("").to_owned(),
            parameters,
            returns: None,
        };
        assert_eq!(desc.name, "files-read_file");
        assert_eq!(desc.description, "Reads a file");
    }
}
