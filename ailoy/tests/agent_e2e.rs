//! Agent end-to-end over the full substrate: agent → runtime → broker →
//! VM → local decode engine (mock tensor backend).
//!
//! Scripts are registered per model id; the `tvm_language_model` factory
//! below builds a mock-backed engine replaying that script, so these
//! tests run without weights while exercising the real packet path.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use futures::StreamExt;

use ailoy::prelude::*;
use ailoy_engine::testing::{EngineFixture, ScriptPiece};
use ailoy_engine::LanguageModelComponent;
use ailoy_tool::ToolError;
use ailoy_vm::{Component, ModuleRegistry};

static SCRIPTS: OnceLock<StdMutex<HashMap<String, Vec<String>>>> = OnceLock::new();

fn scripts() -> &'static StdMutex<HashMap<String, Vec<String>>> {
    SCRIPTS.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// Register what the scripted model under `model_id` will emit.
fn register_script(model_id: &str, pieces: &[&str]) {
    scripts().lock().unwrap().insert(
        model_id.to_owned(),
        pieces.iter().map(|p| p.to_string()).collect(),
    );
}

fn parse_piece(piece: &str) -> ScriptPiece<'_> {
    match piece {
        "<think>" | "</think>" | "<tool_call>" | "</tool_call>" => ScriptPiece::Special(piece),
        "<|im_end|>" => ScriptPiece::Eos,
        text => ScriptPiece::Text(text),
    }
}

/// A `tvm_language_model` module whose weights are a registered script
/// instead of a downloaded artifact. The runtime builder supplies the
/// operator builtins.
fn scripted_modules() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register_component("tvm_language_model", |attrs| async move {
            let model = attrs
                .get("model")
                .and_then(Value::as_str)
                .ok_or_else(|| ComponentError::validation("attrs require a model id"))?;
            let pieces = scripts()
                .lock()
                .unwrap()
                .get(model)
                .cloned()
                .ok_or_else(|| ComponentError::not_found(format!("no script for {model}")))?;
            let script: Vec<ScriptPiece<'_>> =
                pieces.iter().map(|p| parse_piece(p)).collect();
            let fixture = if model.ends_with("-tiny") {
                EngineFixture::tiny_context()
            } else {
                EngineFixture::with_script(&script)
            };
            Ok(Box::new(LanguageModelComponent::new(fixture.engine)) as Box<dyn Component>)
        })
        .unwrap();
    registry
}

async fn agent_for(url: &str, model_id: &str) -> (RuntimeHandle, Agent) {
    let handle = RuntimeBuilder::new()
        .url(url)
        .with_modules(scripted_modules())
        .unwrap()
        .start()
        .unwrap();
    let agent = Agent::define(
        handle.runtime(),
        ModelSpec::local(model_id),
        Some("You are a test assistant.".into()),
    )
    .await
    .unwrap();
    (handle, agent)
}

fn add_tool_desc() -> ToolDesc {
    ToolDesc {
        name: "add".into(),
        description: "Add two integers".into(),
        parameters: Value::from_json(
            r#"{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"integer"}},"required":["a","b"]}"#,
        )
        .unwrap(),
        returns: None,
    }
}

#[tokio::test]
async fn plain_completion_streams_text() {
    register_script("test/plain", &["Hello", " from", " ailoy", "<|im_end|>"]);
    let (_handle, mut agent) = agent_for("inproc://e2e-plain", "test/plain").await;

    let events: Vec<AgentResponse> = agent
        .query("Say hi", QueryOptions::default())
        .collect()
        .await;

    let text: String = events
        .iter()
        .filter_map(|e| e.as_output_text())
        .collect();
    assert!(!text.is_empty());
    assert_eq!(text, "Hello from ailoy");
    assert!(events.iter().all(|e| e.type_name() != "error"));
    // First text event switches type; the rest do not.
    let text_events: Vec<_> = events
        .iter()
        .filter(|e| e.type_name() == "output_text")
        .collect();
    assert!(text_events[0].is_type_switched);
    assert!(text_events[1..].iter().all(|e| !e.is_type_switched));
}

#[tokio::test]
async fn reasoning_toggle_controls_reasoning_events() {
    register_script(
        "test/reasoning",
        &["<think>", "let me think", "</think>", "4", "<|im_end|>"],
    );
    let (_handle, mut agent) = agent_for("inproc://e2e-reasoning", "test/reasoning").await;

    let events: Vec<AgentResponse> = agent
        .query("2+2?", QueryOptions { reasoning: true })
        .collect()
        .await;
    let reasoning: String = events.iter().filter_map(|e| e.as_reasoning()).collect();
    let text: String = events.iter().filter_map(|e| e.as_output_text()).collect();
    assert_eq!(reasoning, "let me think");
    assert_eq!(text, "4");

    // Reasoning comes before output text.
    let first_reasoning = events
        .iter()
        .position(|e| e.type_name() == "reasoning")
        .unwrap();
    let first_text = events
        .iter()
        .position(|e| e.type_name() == "output_text")
        .unwrap();
    assert!(first_reasoning < first_text);

    // Same script with reasoning disabled: zero reasoning events.
    register_script(
        "test/reasoning-off",
        &["<think>", "let me think", "</think>", "4", "<|im_end|>"],
    );
    let (_handle2, mut agent) =
        agent_for("inproc://e2e-reasoning-off", "test/reasoning-off").await;
    let events: Vec<AgentResponse> = agent
        .query("2+2?", QueryOptions { reasoning: false })
        .collect()
        .await;
    assert!(events.iter().all(|e| e.type_name() != "reasoning"));
    let text: String = events.iter().filter_map(|e| e.as_output_text()).collect();
    assert_eq!(text, "4");
}

#[tokio::test]
async fn tool_call_happy_path() {
    register_script(
        "test/tool",
        &[
            "<tool_call>",
            r#"{"name":"add","arguments":{"a":3,"b":4}}"#,
            "</tool_call>",
            "<|im_end|>",
            // Second turn, after the tool result is appended.
            "The sum is 7.",
            "<|im_end|>",
        ],
    );
    let (_handle, mut agent) = agent_for("inproc://e2e-tool", "test/tool").await;
    assert!(agent.add_function_tool(add_tool_desc(), |input| async move {
        let a = input.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = input.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::Int(a + b))
    }));

    let events: Vec<AgentResponse> = agent
        .query("Use add to compute 3+4", QueryOptions::default())
        .collect()
        .await;

    let call_index = events
        .iter()
        .position(|e| e.type_name() == "tool_call")
        .expect("a tool_call event");
    match &events[call_index].content {
        AgentResponseContent::ToolCall(call) => {
            assert_eq!(call.function.name, "add");
            assert_eq!(call.function.arguments.get("a").unwrap().as_i64(), Some(3));
            assert_eq!(call.function.arguments.get("b").unwrap().as_i64(), Some(4));
            assert!(call.id.is_some(), "agent assigns ids to local tool calls");
        }
        other => panic!("unexpected content: {other:?}"),
    }
    assert!(events[call_index].is_type_switched);

    let result_index = events
        .iter()
        .position(|e| e.type_name() == "tool_call_result")
        .expect("a tool_call_result event");
    assert!(result_index > call_index);
    match &events[result_index].content {
        AgentResponseContent::ToolCallResult(message) => {
            assert_eq!(message.role, Role::Tool);
            assert_eq!(message.text(), "7");
            assert!(message.tool_call_id.is_some());
        }
        other => panic!("unexpected content: {other:?}"),
    }

    let text: String = events.iter().filter_map(|e| e.as_output_text()).collect();
    assert!(text.contains('7'), "final answer mentions the sum: {text:?}");

    // The conversation records assistant tool_calls then the tool message.
    let messages = agent.get_messages();
    let assistant = messages
        .iter()
        .find(|m| m.role == Role::Assistant && m.tool_calls.is_some())
        .expect("assistant message with tool_calls");
    let call_id = assistant.tool_calls.as_ref().unwrap()[0].id.clone();
    let tool_message = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_message.tool_call_id, call_id);
}

#[tokio::test]
async fn parallel_tools_report_in_call_order() {
    register_script(
        "test/parallel",
        &[
            "<tool_call>",
            r#"{"name":"slow","arguments":{"x":1}}"#,
            "</tool_call>",
            "<tool_call>",
            r#"{"name":"fast","arguments":{"x":2}}"#,
            "</tool_call>",
            "<|im_end|>",
            "Both done.",
            "<|im_end|>",
        ],
    );
    let (_handle, mut agent) = agent_for("inproc://e2e-parallel", "test/parallel").await;

    let tool_desc = |name: &str| ToolDesc {
        name: name.into(),
        description: "test tool".into(),
        parameters: Value::from_json(r#"{"type":"object","properties":{}}"#).unwrap(),
        returns: None,
    };
    agent.add_function_tool(tool_desc("slow"), |_input| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Value::from("slow-done"))
    });
    agent.add_function_tool(tool_desc("fast"), |_input| async move {
        Ok(Value::from("fast-done"))
    });

    let started = Instant::now();
    let events: Vec<AgentResponse> = agent
        .query("run both", QueryOptions::default())
        .collect()
        .await;
    let elapsed = started.elapsed();

    let results: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.content {
            AgentResponseContent::ToolCallResult(message) => Some(message.text()),
            _ => None,
        })
        .collect();
    // Order matches the assistant message, not completion time.
    assert_eq!(results, vec!["slow-done".to_string(), "fast-done".to_string()]);
    // And the slow tool did not serialize behind the fast one.
    assert!(
        elapsed < Duration::from_millis(600),
        "tools ran sequentially: {elapsed:?}"
    );
}

#[tokio::test]
async fn unknown_tool_fails_that_call_only() {
    register_script(
        "test/unknown-tool",
        &[
            "<tool_call>",
            r#"{"name":"missing","arguments":{}}"#,
            "</tool_call>",
            "<tool_call>",
            r#"{"name":"add","arguments":{"a":1,"b":2}}"#,
            "</tool_call>",
            "<|im_end|>",
            "Recovered.",
            "<|im_end|>",
        ],
    );
    let (_handle, mut agent) = agent_for("inproc://e2e-unknown-tool", "test/unknown-tool").await;
    agent.add_function_tool(add_tool_desc(), |input| async move {
        let a = input.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = input.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::Int(a + b))
    });

    let events: Vec<AgentResponse> = agent
        .query("call tools", QueryOptions::default())
        .collect()
        .await;
    let results: Vec<String> = events
        .iter()
        .filter_map(|e| match &e.content {
            AgentResponseContent::ToolCallResult(message) => Some(message.text()),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert!(results[0].starts_with("Error:"), "unknown tool errors: {results:?}");
    assert_eq!(results[1], "3");
}

#[tokio::test]
async fn invalid_tool_call_payload_ends_with_error() {
    register_script(
        "test/invalid-tool",
        &["<tool_call>", "not-json", "</tool_call>", "<|im_end|>"],
    );
    let (_handle, mut agent) =
        agent_for("inproc://e2e-invalid-tool", "test/invalid-tool").await;

    let events: Vec<AgentResponse> = agent
        .query("break", QueryOptions::default())
        .collect()
        .await;
    let last = events.last().expect("at least one event");
    assert_eq!(last.type_name(), "error");

    // The failed assistant turn is still recorded.
    let last_message = agent.get_messages().last().unwrap();
    assert_eq!(last_message.role, Role::Assistant);
    assert!(!last_message.text().is_empty());
}

#[tokio::test]
async fn oversized_prompt_ends_quietly_with_no_text() {
    register_script("test/overflow-tiny", &["<|im_end|>"]);
    let (_handle, mut agent) =
        agent_for("inproc://e2e-overflow", "test/overflow-tiny").await;

    let long_prompt = "repeat this over and over ".repeat(40);
    let events: Vec<AgentResponse> = agent
        .query(long_prompt.as_str(), QueryOptions::default())
        .collect()
        .await;
    // finish_reason = length: the stream ends without output text.
    assert!(events.iter().all(|e| e.type_name() != "output_text"));
}

#[tokio::test]
async fn native_tool_error_becomes_tool_message() {
    register_script(
        "test/tool-error",
        &[
            "<tool_call>",
            r#"{"name":"add","arguments":{"a":1,"b":2}}"#,
            "</tool_call>",
            "<|im_end|>",
            "Sorry about that.",
            "<|im_end|>",
        ],
    );
    let (_handle, mut agent) = agent_for("inproc://e2e-tool-error", "test/tool-error").await;
    agent.add_function_tool(add_tool_desc(), |_input| async move {
        Err::<Value, _>(ToolError::Execution("arithmetic unit offline".into()))
    });

    let events: Vec<AgentResponse> = agent
        .query("add", QueryOptions::default())
        .collect()
        .await;
    let result = events
        .iter()
        .find_map(|e| match &e.content {
            AgentResponseContent::ToolCallResult(message) => Some(message.text()),
            _ => None,
        })
        .expect("a tool result");
    assert!(result.contains("arithmetic unit offline"));

    // The model continued after seeing the error.
    let text: String = events.iter().filter_map(|e| e.as_output_text()).collect();
    assert_eq!(text, "Sorry about that.");
}
