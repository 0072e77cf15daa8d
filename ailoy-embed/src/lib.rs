//! # ailoy-embed — embedding models and vector stores
//!
//! Text-to-vector inference over the tensor-runtime seam, and cosine
//! similarity retrieval over either an in-memory index or an HTTP-backed
//! collection.

#![deny(missing_docs)]

mod component;
mod store;

use std::sync::Arc;

use thiserror::Error;

use ailoy_cache::ModelArtifacts;
use ailoy_engine::Tokenizer;
use ailoy_types::{ComponentError, ErrorKind};

pub use component::{
    EMBEDDING_MODEL_TYPE, EmbeddingModelComponent, VectorStoreComponent, embedding_model_module,
    vector_store_module,
};
pub use store::{HttpVectorStore, InMemoryVectorStore, RetrievedRecord, VectorRecord, VectorStore,
    cosine_similarity};

/// Errors from embedding inference and vector stores.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The tensor runtime reported a failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Tokenization failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// A vector's dimension disagrees with the store's.
    #[error("dimension mismatch: store holds {expected}, got {actual}")]
    Dimension {
        /// The store's dimension.
        expected: usize,
        /// The offered vector's dimension.
        actual: usize,
    },

    /// No record under the given id.
    #[error("record not found: {0}")]
    NotFound(String),

    /// HTTP-backed store transport failure.
    #[error("request failed: {0}")]
    Request(String),

    /// HTTP-backed store answered with a non-2xx status.
    #[error("http {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The HTTP-backed store's response did not parse.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<EmbedError> for ComponentError {
    fn from(err: EmbedError) -> Self {
        let kind = match &err {
            EmbedError::NotFound(_) => ErrorKind::NotFound,
            EmbedError::Dimension { .. } => ErrorKind::Validation,
            EmbedError::Request(_) | EmbedError::Http { .. } => ErrorKind::Io,
            _ => ErrorKind::Internal,
        };
        ComponentError::new(kind, err.to_string())
    }
}

/// The tensor-runtime seam for embedding models: tokens in, one pooled
/// vector out.
pub trait EmbeddingBackend: Send {
    /// Embed a token sequence into a single vector.
    fn embed(&mut self, tokens: &[u32]) -> Result<Vec<f32>, EmbedError>;
}

/// Binds a compiled embedding model library.
pub trait EmbeddingLoader: Send + Sync {
    /// Load the model named by `artifacts`.
    fn load(
        &self,
        artifacts: &ModelArtifacts,
    ) -> Result<(Box<dyn EmbeddingBackend>, Arc<dyn Tokenizer>), EmbedError>;
}

/// A text-to-vector model.
pub struct EmbeddingModel {
    backend: Box<dyn EmbeddingBackend>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl EmbeddingModel {
    /// Assemble a model from its parts.
    pub fn new(backend: Box<dyn EmbeddingBackend>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { backend, tokenizer }
    }

    /// Embed one text.
    pub fn infer(&mut self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let tokens = self
            .tokenizer
            .encode(text)
            .map_err(|e| EmbedError::Tokenizer(e.to_string()))?;
        self.backend.embed(&tokens)
    }
}
