//! Error types shared across the runtime's protocol boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Value construction and downcast errors.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum ValueError {
    /// A typed downcast found a different variant.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The variant the caller asked for.
        expected: &'static str,
        /// The variant actually present.
        actual: String,
    },

    /// JSON text could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// An ndarray buffer disagrees with its shape and dtype.
    #[error("shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch {
        /// Bytes implied by shape × dtype.
        expected: usize,
        /// Bytes actually provided.
        actual: usize,
    },
}

/// Error kinds surfaced to callers across the component boundary.
///
/// Low-level operators report `{kind, message}`; the VM maps that to an
/// error packet and the runtime rehydrates it on the client side.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed inputs: missing required fields, bad enum, bad role.
    Validation,
    /// Component id, tool, preset, or cached file is unknown.
    NotFound,
    /// Duplicate component id or server name.
    AlreadyExists,
    /// Filesystem or HTTP transport failure, including interrupted downloads.
    Io,
    /// Digest mismatch on a cached artifact.
    Integrity,
    /// The KV cache ran out of pages during prefill or decode.
    ContextLengthLimit,
    /// The model emitted a non-parseable tool-call payload.
    InvalidToolCall,
    /// The broker could not deliver a packet.
    Transport,
    /// Cooperative cancellation of a streamed call.
    Cancelled,
    /// Anything that does not fit the kinds above.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Io => "io",
            ErrorKind::Integrity => "integrity",
            ErrorKind::ContextLengthLimit => "context_length_limit",
            ErrorKind::InvalidToolCall => "invalid_tool_call",
            ErrorKind::Transport => "transport",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// The kind + message error shape that crosses the broker wire.
///
/// Every subsystem error collapses into this at the VM boundary; richer
/// context stays in the subsystem's own error enum.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ComponentError {
    /// Which class of failure this is.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ComponentError {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A `validation` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// A `not_found` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// An `already_exists` error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    /// An `io` error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// A `transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// A `cancelled` error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// An `internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<ValueError> for ComponentError {
    fn from(err: ValueError) -> Self {
        ComponentError::validation(err.to_string())
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(err: std::io::Error) -> Self {
        ComponentError::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_wire_names() {
        assert_eq!(ErrorKind::ContextLengthLimit.to_string(), "context_length_limit");
        assert_eq!(ErrorKind::InvalidToolCall.to_string(), "invalid_tool_call");
    }

    #[test]
    fn component_error_serializes_kind_snake_case() {
        let err = ComponentError::not_found("no such component");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert_eq!(json["message"], "no such component");
    }

    #[test]
    fn value_error_maps_to_validation() {
        let err: ComponentError = ValueError::Parse("bad".into()).into();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
