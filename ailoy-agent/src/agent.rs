//! The agent: conversation state, tool registry, and the streaming
//! query loop.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, warn};
use uuid::Uuid;

use ailoy_broker::Runtime;
use ailoy_mcp::McpClient;
use ailoy_tool::{
    Authenticator, BuiltinTool, NativeTool, RestApiTool, Tool, ToolRegistry, load_preset,
};
use ailoy_types::{
    FinishReason, Message, MessageAccumulator, MessageContent, MessageOutput, ToolCall, ToolDesc,
    Value,
};

use crate::error::AgentError;
use crate::input::AgentInput;
use crate::model::ModelSpec;
use crate::response::{AgentResponse, AgentResponseContent, EventTyper};

/// Options for one query.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    /// Surface reasoning deltas (and ask the model to think).
    pub reasoning: bool,
}

/// A tool-using conversational agent bound to one model component.
pub struct Agent {
    runtime: Runtime,
    component_id: Option<Uuid>,
    messages: Vec<Message>,
    tools: ToolRegistry,
    mcp_clients: Vec<McpClient>,
    next_call_id: u64,
}

impl Agent {
    /// Create an agent: instantiate the model component and seed the
    /// conversation with a system message (a model-derived default when
    /// the host passes `None`).
    pub async fn define(
        runtime: Runtime,
        model: ModelSpec,
        system_message: Option<String>,
    ) -> Result<Self, AgentError> {
        let component_id = runtime
            .define_component(model.component_type(), model.attrs())
            .await?;
        let system = system_message.unwrap_or_else(|| model.default_system_message());
        Ok(Self {
            runtime,
            component_id: Some(component_id),
            messages: vec![Message::system(system)],
            tools: ToolRegistry::new(),
            mcp_clients: Vec::new(),
            next_call_id: 0,
        })
    }

    /// The conversation so far.
    pub fn get_messages(&self) -> &[Message] {
        &self.messages
    }

    /// Drop every message except the seeded system message.
    pub fn clear_messages(&mut self) {
        self.messages.truncate(1);
    }

    /// Descriptors of the registered tools.
    pub fn get_tools(&self) -> Vec<ToolDesc> {
        self.tools.descriptors()
    }

    /// Remove every registered tool.
    pub fn clear_tools(&mut self) {
        self.tools.clear();
    }

    /// Register any tool. Returns `false` when the name is taken.
    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) -> bool {
        self.tools.register(tool)
    }

    /// Register a native async function as a tool.
    pub fn add_function_tool<F, Fut>(&mut self, desc: ToolDesc, function: F) -> bool
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ailoy_tool::ToolError>> + Send + 'static,
    {
        self.add_tool(Arc::new(NativeTool::new(desc, function)))
    }

    /// Register a tool that invokes a VM operator.
    pub fn add_builtin_tool(
        &mut self,
        definition: &ailoy_types::ToolDefinition,
    ) -> Result<bool, AgentError> {
        let tool = BuiltinTool::from_definition(definition, self.runtime.clone())?;
        Ok(self.add_tool(Arc::new(tool)))
    }

    /// Register a templated REST tool.
    pub fn add_restapi_tool(
        &mut self,
        definition: &ailoy_types::ToolDefinition,
        authenticator: Option<Authenticator>,
    ) -> Result<bool, AgentError> {
        let tool = RestApiTool::from_definition(definition, self.runtime.clone(), authenticator)?;
        Ok(self.add_tool(Arc::new(tool)))
    }

    /// Register every tool of a bundled preset. Returns how many were
    /// added (duplicates are skipped).
    pub fn add_tools_from_preset(
        &mut self,
        preset: &str,
        authenticator: Option<Authenticator>,
    ) -> Result<usize, AgentError> {
        let definitions = load_preset(preset)?;
        let mut added = 0;
        for definition in definitions.values() {
            let registered = match definition {
                ailoy_types::ToolDefinition::Builtin { .. } => {
                    self.add_builtin_tool(definition)?
                }
                ailoy_types::ToolDefinition::Restapi { .. } => {
                    self.add_restapi_tool(definition, authenticator.clone())?
                }
                _ => unreachable!("ToolDefinition has no other variants in this workspace"),
            };
            if registered {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Attach an MCP client, registering its tools under
    /// `<server>-<tool>` names.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` when a client with the same server name is
    /// attached.
    pub async fn add_tools_from_mcp_client(
        &mut self,
        client: McpClient,
    ) -> Result<usize, AgentError> {
        if self.mcp_clients.iter().any(|c| c.name() == client.name()) {
            return Err(AgentError::AlreadyExists(format!(
                "mcp server {}",
                client.name()
            )));
        }
        let tools = client.tools().await?;
        let mut added = 0;
        for tool in tools {
            if self.tools.register(tool) {
                added += 1;
            }
        }
        self.mcp_clients.push(client);
        Ok(added)
    }

    /// Detach an MCP client and remove its tools.
    pub async fn remove_mcp_client(&mut self, name: &str) -> Result<(), AgentError> {
        let index = self
            .mcp_clients
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| AgentError::NotFound(format!("mcp server {name}")))?;
        let client = self.mcp_clients.remove(index);
        self.tools.remove_by_prefix(&format!("{name}-"));
        client.close().await?;
        Ok(())
    }

    /// Destroy the bound model component. The agent cannot query after
    /// this.
    pub async fn delete(&mut self) -> Result<(), AgentError> {
        if let Some(id) = self.component_id.take() {
            self.runtime.delete_component(id).await?;
        }
        Ok(())
    }

    /// Ask the model, streaming [`AgentResponse`] events until the turn
    /// (including any tool calls) completes.
    pub fn query(
        &mut self,
        input: impl Into<AgentInput>,
        options: QueryOptions,
    ) -> impl Stream<Item = AgentResponse> + '_ {
        let input = input.into();
        async_stream::stream! {
            let mut typer = EventTyper::default();
            let Some(component) = self.component_id else {
                yield typer.stamp(AgentResponseContent::Error(
                    "agent has no model component".into(),
                ));
                return;
            };

            self.messages.push(input.into_message());

            'turns: loop {
                let request = infer_request(&self.messages, &self.tools, options.reasoning);
                let mut frames = self.runtime.iter_method(component, "infer", request);
                let mut accumulator = MessageAccumulator::new();
                let mut finish: Option<FinishReason> = None;

                while let Some(frame) = frames.next().await {
                    let output = match frame {
                        Ok(value) => match parse_output(&value) {
                            Ok(output) => output,
                            Err(message) => {
                                yield typer.stamp(AgentResponseContent::Error(message));
                                finish = Some(FinishReason::Error);
                                break;
                            }
                        },
                        Err(e) => {
                            yield typer.stamp(AgentResponseContent::Error(e.to_string()));
                            finish = Some(FinishReason::Error);
                            break;
                        }
                    };

                    let mut delta = output.message;
                    // Tool calls need stable ids so results can link back.
                    if let Some(calls) = &mut delta.tool_calls {
                        for call in calls.iter_mut() {
                            if call.id.is_none() {
                                call.id = Some(format!("call_{}", self.next_call_id));
                                self.next_call_id += 1;
                            }
                        }
                    }
                    accumulator.push(&delta);

                    let failed = matches!(
                        output.finish_reason,
                        Some(FinishReason::InvalidToolCall) | Some(FinishReason::Error)
                    );
                    if let Some(parts) = &delta.reasoning {
                        for part in parts {
                            if let Some(text) = part.as_text() {
                                yield typer.stamp(AgentResponseContent::Reasoning(text.to_owned()));
                            }
                        }
                    }
                    if let Some(parts) = &delta.content {
                        for part in parts {
                            if let Some(text) = part.as_text() {
                                // A failing frame's text is its diagnostic.
                                let content = if failed {
                                    AgentResponseContent::Error(text.to_owned())
                                } else {
                                    AgentResponseContent::OutputText(text.to_owned())
                                };
                                yield typer.stamp(content);
                            }
                        }
                    }
                    if let Some(calls) = &delta.tool_calls {
                        for call in calls {
                            yield typer.stamp(AgentResponseContent::ToolCall(call.clone()));
                        }
                    }

                    if output.finish_reason.is_some() {
                        finish = output.finish_reason;
                    }
                }

                let assistant = accumulator.into_message();
                let has_substance = assistant.content.is_some()
                    || assistant.tool_calls.is_some()
                    || assistant.reasoning.is_some();
                if has_substance {
                    self.messages.push(assistant.clone());
                }

                match finish {
                    Some(FinishReason::ToolCalls) => {
                        let calls = assistant.tool_calls.unwrap_or_default();
                        debug!(count = calls.len(), "dispatching tool calls");
                        for response in self.dispatch_tools(&calls).await {
                            yield typer.stamp(response);
                        }
                        continue 'turns;
                    }
                    _ => break 'turns,
                }
            }
        }
    }

    /// Run every tool call concurrently; append and report results in
    /// the order the calls appear in the assistant message.
    async fn dispatch_tools(&mut self, calls: &[ToolCall]) -> Vec<AgentResponseContent> {
        let executions = calls.iter().map(|call| {
            let tools = self.tools.clone();
            let name = call.function.name.clone();
            let arguments = call.function.arguments.clone();
            async move { tools.execute(&name, arguments).await }
        });
        let results = futures::future::join_all(executions).await;

        let mut responses = Vec::with_capacity(calls.len());
        for (call, result) in calls.iter().zip(results) {
            let content = match result {
                Ok(value) => MessageContent::Text(result_text(&value)),
                Err(e) => {
                    warn!(tool = %call.function.name, error = %e, "tool call failed");
                    MessageContent::Text(format!("Error: {e}"))
                }
            };
            let message = Message::tool_result(call.id.clone(), content);
            self.messages.push(message.clone());
            responses.push(AgentResponseContent::ToolCallResult(message));
        }
        responses
    }
}

fn infer_request(messages: &[Message], tools: &ToolRegistry, reasoning: bool) -> Value {
    let descriptors = tools.descriptors();
    let json = serde_json::json!({
        "messages": messages,
        "tools": descriptors,
        "reasoning": reasoning,
    });
    Value::from(json)
}

fn parse_output(value: &Value) -> Result<MessageOutput, String> {
    serde_json::from_value(serde_json::Value::from(value))
        .map_err(|e| format!("malformed model frame: {e}"))
}

fn result_text(value: &Value) -> String {
    match value {
        Value::Str(text) => text.clone(),
        other => other.to_json(),
    }
}
