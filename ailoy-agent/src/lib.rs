//! # ailoy-agent — the agent control loop
//!
//! An [`Agent`] binds a model component (local decode engine or remote
//! provider), holds the conversation and a tool registry, and answers
//! queries with an ordered stream of [`AgentResponse`] events: text and
//! reasoning deltas, tool calls, and tool results. Tool calls within one
//! turn run concurrently; their results are appended in call order.

#![deny(missing_docs)]

mod agent;
mod error;
mod input;
mod model;
mod response;

pub use agent::{Agent, QueryOptions};
pub use error::AgentError;
pub use input::{AgentInput, audio_part, image_part};
pub use model::ModelSpec;
pub use response::{AgentResponse, AgentResponseContent};
