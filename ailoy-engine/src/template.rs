//! Chat-template rendering with message canonicalization.
//!
//! Templates are Jinja files shipped next to the model weights. Before
//! rendering, a fixed sequence of canonicalization passes runs on a deep
//! copy of the conversation so every template sees one uniform message
//! shape; the caller's messages are never mutated.

use std::path::Path;

use minijinja::Environment;
use serde::Serialize;

use ailoy_types::{Message, MessageContent, Part, Role, ToolDesc};

use crate::config::TemplateConfig;
use crate::error::EngineError;

/// Name under which the chat template is registered in the environment.
const TEMPLATE_NAME: &str = "chat";

/// A loaded chat template plus the delimiter tokens of its model.
pub struct ChatTemplate {
    env: Environment<'static>,
    config: TemplateConfig,
}

impl ChatTemplate {
    /// Build from template source and its config.
    pub fn new(source: String, config: TemplateConfig) -> Result<Self, EngineError> {
        let mut env = Environment::new();
        env.add_template_owned(TEMPLATE_NAME, source)
            .map_err(|e| EngineError::Template(e.to_string()))?;
        Ok(Self { env, config })
    }

    /// Load the template named by `config` from the model directory.
    pub fn from_dir(model_dir: &Path, config: TemplateConfig) -> Result<Self, EngineError> {
        let path = model_dir.join(&config.template_file);
        let source = std::fs::read_to_string(&path)
            .map_err(|e| EngineError::Artifact(format!("{}: {e}", path.display())))?;
        Self::new(source, config)
    }

    /// The delimiter-token config.
    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    /// Render the model-specific prompt.
    ///
    /// Canonicalization runs on a copy; rendering the same input twice
    /// yields byte-identical prompts.
    pub fn apply(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDesc]>,
        reasoning_enabled: bool,
        add_generation_prompt: bool,
    ) -> Result<String, EngineError> {
        let canonical = canonicalize(messages);
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| EngineError::Template(e.to_string()))?;

        #[derive(Serialize)]
        struct Context<'a> {
            messages: &'a [Message],
            tools: &'a [ToolDesc],
            add_generation_prompt: bool,
            enable_thinking: bool,
            bos_token: &'a str,
            eos_token: &'a str,
        }

        template
            .render(minijinja::Value::from_serialize(&Context {
                messages: &canonical,
                tools: tools.unwrap_or(&[]),
                add_generation_prompt,
                enable_thinking: reasoning_enabled,
                bos_token: &self.config.bos_token,
                eos_token: &self.config.eos_token,
            }))
            .map_err(|e| EngineError::Template(e.to_string()))
    }
}

/// Run the canonicalization passes, in order, on a deep copy.
pub fn canonicalize(messages: &[Message]) -> Vec<Message> {
    let mut messages = messages.to_vec();
    remove_tool_call_id(&mut messages);
    put_default_reasoning(&mut messages);
    melt_reasoning(&mut messages);
    merge_text_data(&mut messages);
    melt_content_text(&mut messages);
    messages
}

/// Templates must not see tool-call ids: drop `id` from assistant tool
/// calls and `tool_call_id` from tool messages.
fn remove_tool_call_id(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        if let Some(calls) = &mut message.tool_calls {
            for call in calls {
                call.id = None;
            }
        }
        if message.role == Role::Tool {
            message.tool_call_id = None;
        }
    }
}

/// Give every substantive assistant message a reasoning field so the
/// template's reasoning branch is uniform.
fn put_default_reasoning(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        if message.role == Role::Assistant
            && (message.content.is_some() || message.tool_calls.is_some())
            && message.reasoning.is_none()
        {
            message.reasoning = Some(vec![Part::text("\n\n")]);
        }
    }
}

/// Fold reasoning into the content as a leading `<think>` block.
fn melt_reasoning(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        let Some(reasoning) = message.reasoning.take() else {
            continue;
        };
        let text: String = reasoning.iter().filter_map(Part::as_text).collect();
        let think = Part::text(format!("<think>{text}</think>\n\n"));
        let parts = match message.content.take() {
            None => vec![think],
            Some(MessageContent::Text(s)) => vec![think, Part::text(s)],
            Some(MessageContent::Parts(mut parts)) => {
                parts.insert(0, think);
                parts
            }
        };
        message.content = Some(MessageContent::Parts(parts));
    }
}

/// Coalesce consecutive text parts inside content and reasoning.
fn merge_text_data(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        if let Some(MessageContent::Parts(parts)) = &mut message.content {
            merge_parts(parts);
        }
        if let Some(parts) = &mut message.reasoning {
            merge_parts(parts);
        }
    }
}

fn merge_parts(parts: &mut Vec<Part>) {
    let mut merged: Vec<Part> = Vec::with_capacity(parts.len());
    for part in parts.drain(..) {
        match (merged.last_mut(), &part) {
            (Some(Part::Text { text: last }), Part::Text { text }) => last.push_str(text),
            _ => merged.push(part),
        }
    }
    *parts = merged;
}

/// Collapse single-text-part content to a bare string.
fn melt_content_text(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        let collapsed = match &message.content {
            Some(MessageContent::Parts(parts)) if parts.len() == 1 => {
                parts[0].as_text().map(str::to_owned)
            }
            _ => None,
        };
        if let Some(text) = collapsed {
            message.content = Some(MessageContent::Text(text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ailoy_types::{FunctionCall, ToolCall, Value};

    fn template_config() -> TemplateConfig {
        TemplateConfig {
            template_file: "chat-template.j2".into(),
            bos_token: String::new(),
            eos_token: "<|im_end|>".into(),
            botc_token: Some("<tool_call>".into()),
            eotc_token: Some("</tool_call>".into()),
        }
    }

    fn assistant_with_reasoning() -> Message {
        Message {
            reasoning: Some(vec![Part::text("step one"), Part::text(", step two")]),
            ..Message::assistant_text("the answer")
        }
    }

    #[test]
    fn pipeline_melts_reasoning_into_think_block() {
        let canonical = canonicalize(&[assistant_with_reasoning()]);
        assert_eq!(
            canonical[0].content,
            Some(MessageContent::Text(
                "<think>step one, step two</think>\n\nthe answer".into()
            ))
        );
        assert!(canonical[0].reasoning.is_none());
    }

    #[test]
    fn default_reasoning_inserted_for_tool_call_messages() {
        let message = Message {
            tool_calls: Some(vec![ToolCall {
                id: Some("call_1".into()),
                function: FunctionCall {
                    name: "add".into(),
                    arguments: Value::Null,
                },
            }]),
            ..Message::new(Role::Assistant)
        };
        let canonical = canonicalize(&[message]);
        // Default "\n\n" reasoning, melted into an empty think block.
        assert_eq!(
            canonical[0].content,
            Some(MessageContent::Text("<think>\n\n</think>\n\n".into()))
        );
        // Ids are stripped before the template sees them.
        assert_eq!(canonical[0].tool_calls.as_ref().unwrap()[0].id, None);
    }

    #[test]
    fn tool_message_loses_call_id() {
        let message = Message::tool_result(Some("call_9".into()), "42".into());
        let canonical = canonicalize(&[message]);
        assert_eq!(canonical[0].tool_call_id, None);
    }

    #[test]
    fn canonicalize_does_not_mutate_input() {
        let original = vec![assistant_with_reasoning()];
        let snapshot = original.clone();
        let _ = canonicalize(&original);
        assert_eq!(original, snapshot);
    }

    #[test]
    fn canonicalize_is_deterministic() {
        let input = vec![
            Message::system("be brief"),
            Message::user_text("hi"),
            assistant_with_reasoning(),
        ];
        assert_eq!(canonicalize(&input), canonicalize(&input));
    }

    #[test]
    fn render_is_deterministic_and_ordered() {
        let source = r#"{% for m in messages %}<|im_start|>{{ m.role }}
{{ m.content }}<|im_end|>
{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant
{% endif %}"#;
        let template = ChatTemplate::new(source.into(), template_config()).unwrap();
        let messages = vec![Message::system("be brief"), Message::user_text("hello")];
        let first = template.apply(&messages, None, false, true).unwrap();
        let second = template.apply(&messages, None, false, true).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("<|im_start|>system\nbe brief<|im_end|>"));
        assert!(first.contains("<|im_start|>user\nhello<|im_end|>"));
        assert!(first.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn tools_are_visible_to_the_template() {
        let source = r#"{% for t in tools %}{{ t.name }};{% endfor %}"#;
        let template = ChatTemplate::new(source.into(), template_config()).unwrap();
        let tools = vec![ToolDesc {
            name: "add".into(),
            description: "adds".into(),
            parameters: Value::Map(Default::default()),
            returns: None,
        }];
        let rendered = template.apply(&[], Some(&tools), false, false).unwrap();
        assert_eq!(rendered, "add;");
    }
}
