//! # ailoy-engine — the local LLM decode engine
//!
//! Runs TVM-compiled chat models behind the VM's `tvm_language_model`
//! component: chat-template rendering, prefill with longest-common-prefix
//! reuse over a paged KV cache, token-by-token top-p decoding, and a
//! stream-mode state machine that classifies output into `output_text`,
//! `reasoning`, and `tool_call`, the latter under grammar-constrained
//! sampling.
//!
//! The tensor runtime and the grammar engine are consumed through the
//! seams in [`backend`]; mock implementations live in [`testing`] behind
//! the `test-utils` feature.

#![deny(missing_docs)]

pub mod backend;
pub mod component;
pub mod config;
pub mod engine;
pub mod error;
pub mod kv;
pub mod modes;
pub mod template;
pub mod tokenizer;
pub mod turn;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backend::{
    EmbeddingRef, Grammar, GrammarCompiler, GrammarMatcher, KvBackend, KvConfig, ModelBackend,
};
pub use component::{LANGUAGE_MODEL_TYPE, LanguageModelComponent, language_model_module};
pub use config::{ModelConfig, SamplingConfig, TemplateConfig};
pub use engine::{BackendLoader, LocalEngine, StepOutcome};
pub use error::EngineError;
pub use kv::PagedKvCache;
pub use modes::{ModeRegistry, StreamMode};
pub use template::{ChatTemplate, canonicalize};
pub use tokenizer::{HfTokenizer, IncrementalDetokenizer, Tokenizer};
pub use turn::{InferRequest, InferTurn};
