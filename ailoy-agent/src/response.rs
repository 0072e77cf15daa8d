//! Events an agent yields while answering a query.

use serde::Serialize;

use ailoy_types::{Message, Role, ToolCall};

/// What one agent event carries.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum AgentResponseContent {
    /// A fragment of visible assistant text.
    OutputText(String),
    /// A fragment of assistant reasoning.
    Reasoning(String),
    /// A completed tool call emitted by the assistant.
    ToolCall(ToolCall),
    /// The tool message appended after a tool finished.
    ToolCallResult(Message),
    /// A terminal error.
    Error(String),
}

impl AgentResponseContent {
    /// The event's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            AgentResponseContent::OutputText(_) => "output_text",
            AgentResponseContent::Reasoning(_) => "reasoning",
            AgentResponseContent::ToolCall(_) => "tool_call",
            AgentResponseContent::ToolCallResult(_) => "tool_call_result",
            AgentResponseContent::Error(_) => "error",
        }
    }

    /// Who the event belongs to: tool results come from tools, the rest
    /// from the assistant.
    pub fn role(&self) -> Role {
        match self {
            AgentResponseContent::ToolCallResult(_) => Role::Tool,
            _ => Role::Assistant,
        }
    }
}

/// One streamed agent event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    /// The payload.
    #[serde(flatten)]
    pub content: AgentResponseContent,
    /// True when this event's type differs from the previously yielded
    /// one. Tool calls and tool results always switch.
    pub is_type_switched: bool,
}

impl AgentResponse {
    /// The event's type tag.
    pub fn type_name(&self) -> &'static str {
        self.content.type_name()
    }

    /// The event's role.
    pub fn role(&self) -> Role {
        self.content.role()
    }

    /// The text of an `OutputText` event.
    pub fn as_output_text(&self) -> Option<&str> {
        match &self.content {
            AgentResponseContent::OutputText(text) => Some(text),
            _ => None,
        }
    }

    /// The text of a `Reasoning` event.
    pub fn as_reasoning(&self) -> Option<&str> {
        match &self.content {
            AgentResponseContent::Reasoning(text) => Some(text),
            _ => None,
        }
    }
}

/// Tracks the previous event type and stamps `is_type_switched`.
#[derive(Debug, Default)]
pub(crate) struct EventTyper {
    previous: Option<&'static str>,
}

impl EventTyper {
    pub(crate) fn stamp(&mut self, content: AgentResponseContent) -> AgentResponse {
        let type_name = content.type_name();
        let always_switches = matches!(type_name, "tool_call" | "tool_call_result");
        let is_type_switched = always_switches || self.previous != Some(type_name);
        self.previous = Some(type_name);
        AgentResponse {
            content,
            is_type_switched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_switches() {
        let mut typer = EventTyper::default();
        let event = typer.stamp(AgentResponseContent::OutputText("a".into()));
        assert!(event.is_type_switched);
    }

    #[test]
    fn repeated_text_does_not_switch() {
        let mut typer = EventTyper::default();
        typer.stamp(AgentResponseContent::OutputText("a".into()));
        let event = typer.stamp(AgentResponseContent::OutputText("b".into()));
        assert!(!event.is_type_switched);
    }

    #[test]
    fn reasoning_to_text_switches() {
        let mut typer = EventTyper::default();
        typer.stamp(AgentResponseContent::Reasoning("hmm".into()));
        let event = typer.stamp(AgentResponseContent::OutputText("a".into()));
        assert!(event.is_type_switched);
    }

    #[test]
    fn tool_calls_always_switch() {
        let mut typer = EventTyper::default();
        let call = ToolCall {
            id: None,
            function: ailoy_types::FunctionCall {
                name: "add".into(),
                arguments: ailoy_types::Value::Null,
            },
        };
        typer.stamp(AgentResponseContent::ToolCall(call.clone()));
        let event = typer.stamp(AgentResponseContent::ToolCall(call));
        assert!(event.is_type_switched);
    }
}
