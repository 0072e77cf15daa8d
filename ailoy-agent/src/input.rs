//! Query input normalization.
//!
//! Hosts hand the agent strings, images, or audio; everything collapses
//! into content parts before the model sees it. Images become base64
//! `data:` URIs, so the engines only ever deal with one representation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use ailoy_types::{InputAudio, Message, MessageContent, Part, Role};

/// Input to [`Agent::query`](crate::Agent::query).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentInput {
    /// Plain text.
    Text(String),
    /// Pre-built content parts.
    Parts(Vec<Part>),
}

impl AgentInput {
    /// Build the user message this input becomes.
    pub(crate) fn into_message(self) -> Message {
        let parts = match self {
            AgentInput::Text(text) => vec![Part::text(text)],
            AgentInput::Parts(parts) => parts,
        };
        Message {
            content: Some(MessageContent::Parts(parts)),
            ..Message::new(Role::User)
        }
    }
}

impl From<&str> for AgentInput {
    fn from(text: &str) -> Self {
        AgentInput::Text(text.to_owned())
    }
}

impl From<String> for AgentInput {
    fn from(text: String) -> Self {
        AgentInput::Text(text)
    }
}

impl From<Vec<Part>> for AgentInput {
    fn from(parts: Vec<Part>) -> Self {
        AgentInput::Parts(parts)
    }
}

/// Encode image bytes as an `image_url` part with a base64 `data:` URI.
pub fn image_part(mime_type: &str, bytes: &[u8]) -> Part {
    Part::image_url(format!("data:{mime_type};base64,{}", BASE64.encode(bytes)))
}

/// Encode audio bytes as an `input_audio` part.
pub fn audio_part(format: &str, bytes: &[u8]) -> Part {
    Part::InputAudio {
        input_audio: InputAudio {
            data: BASE64.encode(bytes),
            format: format.to_owned(),
        },
    }
}
