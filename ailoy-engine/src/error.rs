//! Decode engine errors.

use thiserror::Error;

use ailoy_types::{ComponentError, ErrorKind};

/// Errors raised by the local decode engine and its collaborators.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// The KV cache is out of pages for the requested tokens.
    #[error("context length limit exceeded")]
    ContextLengthLimit,

    /// Tokenization or detokenization failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Chat template loading or rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// Grammar compilation failed.
    #[error("grammar error: {0}")]
    Grammar(String),

    /// The tensor runtime reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// A model artifact is missing or malformed.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// A cached artifact's size disagrees with its metadata.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Malformed engine inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem failure while loading artifacts.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache-layer failure while resolving artifacts.
    #[error(transparent)]
    Cache(#[from] ailoy_cache::CacheError),
}

impl From<EngineError> for ComponentError {
    fn from(err: EngineError) -> Self {
        let kind = match &err {
            EngineError::ContextLengthLimit => ErrorKind::ContextLengthLimit,
            EngineError::InvalidInput(_) | EngineError::Template(_) => ErrorKind::Validation,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Artifact(_) => ErrorKind::NotFound,
            EngineError::Cache(cache) => cache_kind(cache),
            _ => ErrorKind::Internal,
        };
        ComponentError::new(kind, err.to_string())
    }
}

fn cache_kind(cache: &ailoy_cache::CacheError) -> ErrorKind {
    match cache {
        ailoy_cache::CacheError::Integrity { .. } => ErrorKind::Integrity,
        ailoy_cache::CacheError::NotFound(_) => ErrorKind::NotFound,
        ailoy_cache::CacheError::Manifest { .. } => ErrorKind::Validation,
        _ => ErrorKind::Io,
    }
}
