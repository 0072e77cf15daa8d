//! Lazy frame production for the `infer` operator.
//!
//! [`LocalEngine::begin_turn`] renders and prefills the prompt;
//! [`LocalEngine::step_turn`] drives decode steps until it has one
//! [`MessageOutput`] frame to hand back. Text fragments stream as they
//! decode; tool-call tokens accumulate silently until the closing
//! indicator, then parse into a single tool-call frame.

use serde::{Deserialize, Serialize};

use ailoy_types::{
    FinishReason, FunctionCall, Message, MessageDelta, MessageOutput, ToolCall, ToolDesc, Value,
};

use crate::engine::LocalEngine;
use crate::error::EngineError;
use crate::modes::{REASONING, TOOL_CALL, Transition};
use crate::tokenizer::IncrementalDetokenizer;

/// Inputs of one `infer` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferRequest {
    /// The conversation so far.
    pub messages: Vec<Message>,
    /// Tools offered to the model.
    #[serde(default)]
    pub tools: Vec<ToolDesc>,
    /// Whether reasoning deltas are surfaced.
    #[serde(default)]
    pub reasoning: bool,
}

/// In-flight state of one model turn.
pub struct InferTurn {
    last_token: u32,
    detok: IncrementalDetokenizer,
    mode_tokens: Vec<u32>,
    reasoning_enabled: bool,
    saw_tool_calls: bool,
    pending_finish: Option<FinishReason>,
    done: bool,
}

impl LocalEngine {
    /// Render, encode, and prefill the prompt for one turn.
    ///
    /// A prompt that exceeds the KV capacity does not fail: the turn
    /// yields a single `finish_reason = "length"` frame.
    pub fn begin_turn(&mut self, request: &InferRequest) -> Result<InferTurn, EngineError> {
        let tokens = self.encode_prompt(&request.messages, &request.tools, request.reasoning)?;
        let mut turn = InferTurn {
            last_token: 0,
            detok: IncrementalDetokenizer::new(self.tokenizer()),
            mode_tokens: Vec::new(),
            reasoning_enabled: request.reasoning,
            saw_tool_calls: false,
            pending_finish: None,
            done: false,
        };
        match self.prefill(&tokens) {
            Ok(last) => turn.last_token = last,
            Err(EngineError::ContextLengthLimit) => {
                turn.pending_finish = Some(FinishReason::Length);
            }
            Err(e) => return Err(e),
        }
        Ok(turn)
    }

    /// Produce the next frame of the turn, or `None` when it is over.
    pub fn step_turn(&mut self, turn: &mut InferTurn) -> Result<Option<MessageOutput>, EngineError> {
        if turn.done {
            return Ok(None);
        }
        if let Some(reason) = turn.pending_finish.take() {
            turn.done = true;
            return Ok(Some(MessageOutput::finish(reason)));
        }

        loop {
            let step = match self.decode_step(turn.last_token) {
                Ok(step) => step,
                Err(EngineError::ContextLengthLimit) => {
                    turn.done = true;
                    return Ok(Some(MessageOutput::finish(FinishReason::Length)));
                }
                Err(e) => {
                    turn.done = true;
                    return Ok(Some(MessageOutput {
                        message: MessageDelta::content_text(e.to_string()),
                        finish_reason: Some(FinishReason::Error),
                    }));
                }
            };
            turn.last_token = step.token;

            if step.token == self.eos_token() {
                turn.done = true;
                let reason = if turn.saw_tool_calls {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                };
                return Ok(Some(MessageOutput::finish(reason)));
            }

            match step.transition {
                Some(Transition::Entered { indicator_len, .. }) => {
                    // The indicator's earlier tokens were withheld from
                    // emission; drop them now that the mode is confirmed.
                    turn.detok.retract(indicator_len.saturating_sub(1));
                    turn.mode_tokens.clear();
                    continue;
                }
                Some(Transition::Exited {
                    mode,
                    indicator_len,
                }) => {
                    if mode == REASONING {
                        // Reasoning streamed through the detokenizer; its
                        // withheld close-indicator tokens die there.
                        turn.detok.retract(indicator_len.saturating_sub(1));
                        continue;
                    }
                    let keep = turn
                        .mode_tokens
                        .len()
                        .saturating_sub(indicator_len.saturating_sub(1));
                    turn.mode_tokens.truncate(keep);
                    let tokens = std::mem::take(&mut turn.mode_tokens);
                    if mode == TOOL_CALL {
                        match self.parse_tool_call(&tokens) {
                            Ok(call) => {
                                turn.saw_tool_calls = true;
                                return Ok(Some(MessageOutput::delta(MessageDelta::tool_call(
                                    call,
                                ))));
                            }
                            Err(message) => {
                                turn.done = true;
                                return Ok(Some(MessageOutput {
                                    message: MessageDelta::content_text(message),
                                    finish_reason: Some(FinishReason::InvalidToolCall),
                                }));
                            }
                        }
                    }
                    // Other modes (reasoning, user modes) carry nothing out.
                    continue;
                }
                None => {}
            }

            match self.current_mode() {
                mode if mode == REASONING => {
                    let withhold = self.withhold_len();
                    if let Some(text) = turn.detok.push(step.token, withhold)? {
                        if turn.reasoning_enabled {
                            return Ok(Some(MessageOutput::delta(MessageDelta::reasoning_text(
                                text,
                            ))));
                        }
                        // Reasoning suppressed: decode continues silently.
                    }
                }
                mode if mode == crate::modes::OUTPUT_TEXT => {
                    let withhold = self.withhold_len();
                    if let Some(text) = turn.detok.push(step.token, withhold)? {
                        return Ok(Some(MessageOutput::delta(MessageDelta::content_text(text))));
                    }
                }
                _ => {
                    // tool_call and user modes buffer without emission.
                    turn.mode_tokens.push(step.token);
                }
            }
        }
    }

    fn parse_tool_call(&mut self, tokens: &[u32]) -> Result<ToolCall, String> {
        let text = self
            .tokenizer()
            .decode(tokens, false)
            .map_err(|e| format!("tool call could not be decoded: {e}"))?;
        let parsed = Value::from_json(text.trim())
            .map_err(|e| format!("tool call is not valid JSON: {e} in {text:?}"))?;
        let name = parsed
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("tool call has no name: {text:?}"))?
            .to_owned();
        let arguments = parsed.get("arguments").cloned().unwrap_or(Value::Null);
        Ok(ToolCall {
            id: None,
            function: FunctionCall { name, arguments },
        })
    }
}

impl InferTurn {
    /// True once a terminal frame has been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// A tool-call frame was produced this turn.
    pub fn saw_tool_calls(&self) -> bool {
        self.saw_tool_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ailoy_types::Part;
    use crate::testing::{EngineFixture, ScriptPiece};

    fn text_of(parts: &Option<Vec<Part>>) -> String {
        parts
            .iter()
            .flatten()
            .filter_map(Part::as_text)
            .collect()
    }

    #[test]
    fn plain_completion_streams_text_then_stop() {
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Text("Hi"),
            ScriptPiece::Text(" there"),
            ScriptPiece::Eos,
        ]);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("Say hi")],
                ..Default::default()
            })
            .unwrap();

        let mut text = String::new();
        let mut finish = None;
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            text.push_str(&text_of(&frame.message.content));
            if let Some(reason) = frame.finish_reason {
                finish = Some(reason);
            }
        }
        assert_eq!(text, "Hi there");
        assert_eq!(finish, Some(FinishReason::Stop));
    }

    #[test]
    fn reasoning_streams_only_when_enabled() {
        let script = [
            ScriptPiece::Special("<think>"),
            ScriptPiece::Text("hmm"),
            ScriptPiece::Special("</think>"),
            ScriptPiece::Text("4"),
            ScriptPiece::Eos,
        ];

        // reasoning=true: a reasoning delta then content.
        let mut fixture = EngineFixture::with_script(&script);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("2+2?")],
                reasoning: true,
                ..Default::default()
            })
            .unwrap();
        let mut reasoning = String::new();
        let mut content = String::new();
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            reasoning.push_str(&text_of(&frame.message.reasoning));
            content.push_str(&text_of(&frame.message.content));
        }
        assert_eq!(reasoning, "hmm");
        assert_eq!(content, "4");

        // reasoning=false: zero reasoning deltas, same content.
        let mut fixture = EngineFixture::with_script(&script);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("2+2?")],
                reasoning: false,
                ..Default::default()
            })
            .unwrap();
        let mut saw_reasoning = false;
        let mut content = String::new();
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            saw_reasoning |= frame.message.reasoning.is_some();
            content.push_str(&text_of(&frame.message.content));
        }
        assert!(!saw_reasoning);
        assert_eq!(content, "4");
    }

    #[test]
    fn think_boundary_tokens_are_never_emitted() {
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Special("<think>"),
            ScriptPiece::Text("x"),
            ScriptPiece::Special("</think>"),
            ScriptPiece::Text("ok"),
            ScriptPiece::Eos,
        ]);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("q")],
                reasoning: true,
                ..Default::default()
            })
            .unwrap();
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            let all = format!(
                "{}{}",
                text_of(&frame.message.reasoning),
                text_of(&frame.message.content)
            );
            assert!(!all.contains("think"), "indicator leaked: {all:?}");
        }
    }

    #[test]
    fn tool_call_parses_and_sets_finish_reason() {
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Special("<tool_call>"),
            ScriptPiece::Text(r#"{"name":"add","arguments":{"a":3,"b":4}}"#),
            ScriptPiece::Special("</tool_call>"),
            ScriptPiece::Eos,
        ]);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("add 3 and 4")],
                ..Default::default()
            })
            .unwrap();

        let mut calls = Vec::new();
        let mut finish = None;
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            if let Some(mut frame_calls) = frame.message.tool_calls {
                calls.append(&mut frame_calls);
            }
            if let Some(reason) = frame.finish_reason {
                finish = Some(reason);
            }
        }
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "add");
        assert_eq!(
            calls[0].function.arguments.get("a").unwrap().as_i64(),
            Some(3)
        );
        assert_eq!(finish, Some(FinishReason::ToolCalls));
    }

    #[test]
    fn invalid_tool_call_payload_ends_the_stream() {
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Special("<tool_call>"),
            ScriptPiece::Text("not-json"),
            ScriptPiece::Special("</tool_call>"),
            ScriptPiece::Eos,
        ]);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("q")],
                ..Default::default()
            })
            .unwrap();

        let mut last = None;
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            last = Some(frame);
        }
        let last = last.unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::InvalidToolCall));
        assert!(turn.is_done());
    }

    #[test]
    fn multibyte_fragments_wait_for_complete_code_points() {
        // "é" split into its two UTF-8 bytes across two tokens.
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Bytes(&[0xC3]),
            ScriptPiece::Bytes(&[0xA9]),
            ScriptPiece::Eos,
        ]);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("accent")],
                ..Default::default()
            })
            .unwrap();

        let mut fragments = Vec::new();
        while let Some(frame) = fixture.engine.step_turn(&mut turn).unwrap() {
            let text = text_of(&frame.message.content);
            if !text.is_empty() {
                fragments.push(text);
            }
        }
        assert_eq!(fragments, vec!["é".to_string()]);
    }

    #[test]
    fn kv_exhaustion_finishes_with_length() {
        let mut fixture = EngineFixture::tiny_context();
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text(
                    "a very long prompt that cannot possibly fit in four pages of cache",
                )],
                ..Default::default()
            })
            .unwrap();
        let frame = fixture.engine.step_turn(&mut turn).unwrap().unwrap();
        assert_eq!(frame.finish_reason, Some(FinishReason::Length));
        assert!(fixture.engine.step_turn(&mut turn).unwrap().is_none());
    }
}
