//! # ailoy-types — core types for the ailoy runtime
//!
//! The value tree, conversation message model, streaming output frames,
//! tool descriptors, and the error kinds that cross the component boundary.
//! Every other ailoy crate builds on these shapes; this crate has no I/O.

#![deny(missing_docs)]

pub mod error;
pub mod message;
pub mod tool;
pub mod value;

pub use error::{ComponentError, ErrorKind, ValueError};
pub use message::{
    FinishReason, FunctionCall, ImageUrl, InputAudio, Message, MessageAccumulator,
    MessageContent, MessageDelta, MessageOutput, Part, Role, ToolCall,
};
pub use tool::{HttpMethod, ToolBehavior, ToolDefinition, ToolDesc};
pub use value::{DType, DTypeCode, NdArray, Value, ValueMap};
