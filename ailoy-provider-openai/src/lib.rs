//! # ailoy-provider-openai — remote model engines
//!
//! Drives `openai`, `gemini`, `claude`, and `grok` through the OpenAI
//! chat-completions wire shape, translating between the runtime's
//! [`Message`] model and each provider's quirks, and producing the same
//! [`MessageOutput`] frames the local engine streams.

#![deny(missing_docs)]

mod component;
mod error;
mod types;

use std::time::Duration;

use tracing::debug;

use ailoy_types::{
    FinishReason, FunctionCall, Message, MessageDelta, MessageOutput, Part, Role, ToolCall,
    ToolDesc, Value,
};

pub use component::{RemoteEngineComponent, remote_model_module};
pub use error::ProviderError;

use types::*;

/// Default connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// The OpenAI-compatible providers the engine speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiProvider {
    /// api.openai.com
    OpenAi,
    /// Gemini's OpenAI-compatibility endpoint.
    Gemini,
    /// Anthropic's OpenAI-compatibility endpoint.
    Claude,
    /// xAI.
    Grok,
}

impl ApiProvider {
    /// Component type name for this provider.
    pub fn type_name(&self) -> &'static str {
        match self {
            ApiProvider::OpenAi => "openai",
            ApiProvider::Gemini => "gemini",
            ApiProvider::Claude => "claude",
            ApiProvider::Grok => "grok",
        }
    }

    /// Parse a component type name.
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "openai" => ApiProvider::OpenAi,
            "gemini" => ApiProvider::Gemini,
            "claude" => ApiProvider::Claude,
            "grok" => ApiProvider::Grok,
            _ => return None,
        })
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            ApiProvider::OpenAi => "https://api.openai.com",
            ApiProvider::Gemini => "https://generativelanguage.googleapis.com",
            ApiProvider::Claude => "https://api.anthropic.com",
            ApiProvider::Grok => "https://api.x.ai",
        }
    }

    fn completions_path(&self) -> &'static str {
        match self {
            ApiProvider::Gemini => "/v1beta/openai/chat/completions",
            _ => "/v1/chat/completions",
        }
    }
}

/// A remote LLM engine: one provider + model + key.
pub struct RemoteEngine {
    provider: ApiProvider,
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for RemoteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEngine")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RemoteEngine {
    /// Create an engine with the provider's default endpoint.
    pub fn new(provider: ApiProvider, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key: api_key.into(),
            base_url: provider.default_base_url().to_owned(),
            client: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(READ_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Override the endpoint (testing, proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn completions_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.provider.completions_path()
        )
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDesc]) -> ChatRequest {
        let wire_messages = messages
            .iter()
            .map(|m| self.to_wire_message(m))
            .collect();

        // Claude's compatibility layer rejects an empty tools array.
        let tools_field = if tools.is_empty() && self.provider == ApiProvider::Claude {
            None
        } else {
            Some(
                tools
                    .iter()
                    .map(|t| WireTool {
                        tool_type: "function".into(),
                        function: WireToolFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: serde_json::Value::from(&t.parameters),
                        },
                    })
                    .collect(),
            )
        };

        ChatRequest {
            model: self.model.clone(),
            messages: wire_messages,
            tools: tools_field,
            temperature: None,
        }
    }

    fn to_wire_message(&self, message: &Message) -> WireMessage {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        let content = message.content.as_ref().map(|content| {
            // Claude's layer wants tool results as a bare string.
            if message.role == Role::Tool && self.provider == ApiProvider::Claude {
                serde_json::Value::String(content.joined_text())
            } else {
                serde_json::to_value(content).unwrap_or(serde_json::Value::Null)
            }
        });

        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    call_type: "function".into(),
                    function: WireFunctionCall {
                        name: call.function.name.clone(),
                        arguments: call.function.arguments.to_json(),
                    },
                })
                .collect()
        });

        WireMessage {
            role: role.into(),
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }

    fn parse_response(&self, response: ChatResponse) -> Result<MessageOutput, ProviderError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".into()))?;

        let mut delta = MessageDelta::default();
        if let Some(content) = choice.message.content {
            let text = match content {
                serde_json::Value::String(s) => s,
                serde_json::Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect(),
                _ => String::new(),
            };
            if !text.is_empty() {
                delta.content = Some(vec![Part::text(text)]);
            }
        }

        let has_tool_calls = choice
            .message
            .tool_calls
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false);
        if let Some(calls) = choice.message.tool_calls {
            let rehydrated: Result<Vec<ToolCall>, ProviderError> = calls
                .into_iter()
                .map(|call| {
                    let arguments = Value::from_json(&call.function.arguments).map_err(|e| {
                        ProviderError::InvalidResponse(format!(
                            "tool-call arguments are not JSON: {e}"
                        ))
                    })?;
                    Ok(ToolCall {
                        id: call.id,
                        function: FunctionCall {
                            name: call.function.name,
                            arguments,
                        },
                    })
                })
                .collect();
            delta.tool_calls = Some(rehydrated?);
        }

        let mut finish = match choice.finish_reason.as_deref() {
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        };
        // Grok reports "stop" even when it made tool calls.
        if self.provider == ApiProvider::Grok && has_tool_calls {
            finish = FinishReason::ToolCalls;
        }

        Ok(MessageOutput {
            message: delta,
            finish_reason: Some(finish),
        })
    }

    /// Run one completion, returning a single terminal frame.
    pub async fn infer(
        &self,
        messages: &[Message],
        tools: &[ToolDesc],
    ) -> Result<MessageOutput, ProviderError> {
        let request = self.build_request(messages, tools);
        let url = self.completions_url();
        debug!(url, model = %self.model, "remote completion");

        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::AuthFailed(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        self.parse_response(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ailoy_types::MessageContent as Content;

    fn engine(provider: ApiProvider) -> RemoteEngine {
        RemoteEngine::new(provider, "test-model", "sk-test")
    }

    fn tool() -> ToolDesc {
        ToolDesc {
            name: "add".into(),
            description: "adds two numbers".into(),
            parameters: Value::from_json(r#"{"type":"object","properties":{}}"#).unwrap(),
            returns: None,
        }
    }

    #[test]
    fn gemini_uses_the_openai_compat_path() {
        assert_eq!(
            engine(ApiProvider::Gemini).completions_url(),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
        assert_eq!(
            engine(ApiProvider::OpenAi).completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn claude_drops_empty_tools() {
        let request = engine(ApiProvider::Claude).build_request(&[Message::user_text("hi")], &[]);
        assert!(request.tools.is_none());

        let request = engine(ApiProvider::OpenAi).build_request(&[Message::user_text("hi")], &[]);
        assert!(request.tools.is_some());

        let request =
            engine(ApiProvider::Claude).build_request(&[Message::user_text("hi")], &[tool()]);
        assert_eq!(request.tools.unwrap().len(), 1);
    }

    #[test]
    fn claude_collapses_tool_result_content() {
        let tool_msg = Message::tool_result(
            Some("call_1".into()),
            Content::Parts(vec![Part::text("7")]),
        );
        let wire = engine(ApiProvider::Claude).to_wire_message(&tool_msg);
        assert_eq!(wire.content, Some(serde_json::Value::String("7".into())));

        let wire = engine(ApiProvider::OpenAi).to_wire_message(&tool_msg);
        assert!(wire.content.unwrap().is_array());
    }

    #[test]
    fn tool_call_arguments_serialize_as_string() {
        let msg = Message {
            tool_calls: Some(vec![ToolCall {
                id: Some("call_1".into()),
                function: FunctionCall {
                    name: "add".into(),
                    arguments: Value::map([("a", Value::Int(3))]),
                },
            }]),
            ..Message::new(Role::Assistant)
        };
        let wire = engine(ApiProvider::OpenAi).to_wire_message(&msg);
        let calls = wire.tool_calls.unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"a":3}"#);
    }

    #[test]
    fn response_rehydrates_arguments() {
        let response = ChatResponse {
            choices: vec![Choice {
                message: WireMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(vec![WireToolCall {
                        id: Some("call_9".into()),
                        call_type: "function".into(),
                        function: WireFunctionCall {
                            name: "add".into(),
                            arguments: r#"{"a": 3, "b": 4}"#.into(),
                        },
                    }]),
                    tool_call_id: None,
                },
                finish_reason: Some("tool_calls".into()),
            }],
        };
        let output = engine(ApiProvider::OpenAi).parse_response(response).unwrap();
        assert_eq!(output.finish_reason, Some(FinishReason::ToolCalls));
        let calls = output.message.tool_calls.unwrap();
        assert_eq!(calls[0].function.arguments.get("b").unwrap().as_i64(), Some(4));
    }

    #[test]
    fn grok_overrides_finish_reason_when_tool_calls_present() {
        let response = ChatResponse {
            choices: vec![Choice {
                message: WireMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(vec![WireToolCall {
                        id: None,
                        call_type: "function".into(),
                        function: WireFunctionCall {
                            name: "add".into(),
                            arguments: "{}".into(),
                        },
                    }]),
                    tool_call_id: None,
                },
                finish_reason: Some("stop".into()),
            }],
        };
        let output = engine(ApiProvider::Grok).parse_response(response).unwrap();
        assert_eq!(output.finish_reason, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn debug_redacts_the_api_key() {
        let debugged = format!("{:?}", engine(ApiProvider::OpenAi));
        assert!(!debugged.contains("sk-test"));
    }

    #[tokio::test]
    async fn infer_round_trip() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        let engine = engine(ApiProvider::OpenAi).with_base_url(server.uri());
        let output = engine
            .infer(&[Message::user_text("hi")], &[])
            .await
            .unwrap();
        assert_eq!(output.finish_reason, Some(FinishReason::Stop));
        assert_eq!(
            output.message.content.unwrap()[0].as_text(),
            Some("Hello!")
        );
    }

    #[tokio::test]
    async fn http_errors_surface_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
            .mount(&server)
            .await;

        let engine = engine(ApiProvider::OpenAi).with_base_url(server.uri());
        let err = engine.infer(&[Message::user_text("hi")], &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 500, .. }));
    }
}
