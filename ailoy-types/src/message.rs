//! Conversation messages and the streaming output frame.
//!
//! [`Message`] is the canonical conversation unit shared by the agent, the
//! local decode engine, and the remote providers. [`MessageOutput`] is one
//! frame of a streamed model response; a terminal frame carries a
//! [`FinishReason`].

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction.
    System,
    /// A human user.
    User,
    /// The model.
    Assistant,
    /// A tool result linked to an assistant tool call.
    Tool,
}

/// One part of a message's content.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image referenced by URL (including base64 `data:` URIs).
    ImageUrl {
        /// The image location.
        image_url: ImageUrl,
    },
    /// Base64-encoded audio input.
    InputAudio {
        /// The audio payload.
        input_audio: InputAudio,
    },
}

impl Part {
    /// A text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// An image-URL part.
    pub fn image_url(url: impl Into<String>) -> Self {
        Part::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    /// Borrow the text of a `Text` part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// An image reference inside an `image_url` part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// The URL, usually a base64 `data:` URI by the time it reaches a model.
    pub url: String,
}

/// An audio payload inside an `input_audio` part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudio {
    /// Base64-encoded audio bytes.
    pub data: String,
    /// Container format, e.g. `wav` or `mp3`.
    pub format: String,
}

/// Message content: either a bare string or an ordered list of parts.
///
/// Text-only roles and canonicalized messages use the string form; rich
/// inputs use parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// A single text string.
    Text(String),
    /// Ordered content parts.
    Parts(Vec<Part>),
}

impl MessageContent {
    /// Concatenate every text fragment in the content.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(Part::as_text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_owned())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned identifier linking tool results back to this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The function being called.
    pub function: FunctionCall,
}

/// The function name + arguments of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the registered tool.
    pub name: String,
    /// Arguments as a value tree (already rehydrated from the wire form).
    pub arguments: Value,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The author role.
    pub role: Role,
    /// The message content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    /// Assistant-only: reasoning emitted before the visible content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Vec<Part>>,
    /// Assistant-only: tool invocations requested this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool-only: the id of the originating tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// A bare message with the given role and no content.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            content: None,
            reasoning: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// A system message with text content.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            content: Some(MessageContent::Text(text.into())),
            ..Self::new(Role::System)
        }
    }

    /// A user message with a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            content: Some(MessageContent::Parts(vec![Part::text(text)])),
            ..Self::new(Role::User)
        }
    }

    /// An assistant message with text content.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            content: Some(MessageContent::Text(text.into())),
            ..Self::new(Role::Assistant)
        }
    }

    /// A tool-result message linked to `tool_call_id`.
    pub fn tool_result(tool_call_id: Option<String>, content: MessageContent) -> Self {
        Self {
            content: Some(content),
            tool_call_id,
            ..Self::new(Role::Tool)
        }
    }

    /// Concatenated text of the content, empty when there is none.
    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::joined_text)
            .unwrap_or_default()
    }
}

/// Why a model turn ended.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    Stop,
    /// The assistant requested tool calls.
    ToolCalls,
    /// The model emitted a tool-call payload that failed to parse.
    InvalidToolCall,
    /// The context window ran out during prefill or decode.
    Length,
    /// The stream failed.
    Error,
}

/// Incremental assistant state carried by one streamed frame.
///
/// Every field is a delta: text parts extend the accumulated content,
/// tool-call entries append to the accumulated call list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    /// New reasoning fragments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Vec<Part>>,
    /// New visible content fragments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Part>>,
    /// Newly completed tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl MessageDelta {
    /// A delta carrying one content text fragment.
    pub fn content_text(text: impl Into<String>) -> Self {
        Self {
            content: Some(vec![Part::text(text)]),
            ..Self::default()
        }
    }

    /// A delta carrying one reasoning text fragment.
    pub fn reasoning_text(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(vec![Part::text(text)]),
            ..Self::default()
        }
    }

    /// A delta carrying one completed tool call.
    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_calls: Some(vec![call]),
            ..Self::default()
        }
    }

    /// True when the delta carries nothing.
    pub fn is_empty(&self) -> bool {
        self.reasoning.is_none() && self.content.is_none() && self.tool_calls.is_none()
    }
}

/// One frame of a streamed model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageOutput {
    /// The assistant-state delta carried by this frame.
    pub message: MessageDelta,
    /// Present on the terminal frame of the stream (and on tool-call
    /// frames from non-streaming providers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl MessageOutput {
    /// A frame carrying only a delta.
    pub fn delta(message: MessageDelta) -> Self {
        Self {
            message,
            finish_reason: None,
        }
    }

    /// A terminal frame with no delta.
    pub fn finish(reason: FinishReason) -> Self {
        Self {
            message: MessageDelta::default(),
            finish_reason: Some(reason),
        }
    }
}

/// Fold a stream of [`MessageOutput`] frames into one assistant [`Message`].
///
/// Text parts are concatenated per channel; tool calls accumulate in
/// arrival order.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    reasoning: String,
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl MessageAccumulator {
    /// A fresh accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame's delta in.
    pub fn push(&mut self, delta: &MessageDelta) {
        if let Some(parts) = &delta.reasoning {
            for part in parts {
                if let Some(text) = part.as_text() {
                    self.reasoning.push_str(text);
                }
            }
        }
        if let Some(parts) = &delta.content {
            for part in parts {
                if let Some(text) = part.as_text() {
                    self.content.push_str(text);
                }
            }
        }
        if let Some(calls) = &delta.tool_calls {
            self.tool_calls.extend(calls.iter().cloned());
        }
    }

    /// The tool calls accumulated so far.
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    /// Finish folding and build the assistant message.
    pub fn into_message(self) -> Message {
        Message {
            role: Role::Assistant,
            content: (!self.content.is_empty()).then(|| MessageContent::Text(self.content)),
            reasoning: (!self.reasoning.is_empty()).then(|| vec![Part::text(self.reasoning)]),
            tool_calls: (!self.tool_calls.is_empty()).then_some(self.tool_calls),
            tool_call_id: None,
        }
    }
}
