//! Seams onto the tensor runtime and the grammar engine.
//!
//! The compiled model library is consumed through [`ModelBackend`]: the
//! packed functions `embed`, `prefill`, `decode`, `apply_bitmask_inplace`,
//! `sample_top_p_from_logits`, plus the paged KV-state builtins behind
//! [`KvBackend`]. The grammar engine is consumed through
//! [`GrammarCompiler`] / [`Grammar`] / [`GrammarMatcher`]. Production
//! implementations bind the real runtimes; tests use the mocks in
//! [`testing`](crate::testing).

use std::sync::Arc;

use crate::error::EngineError;

/// Handle to a device-resident activation produced by
/// [`ModelBackend::embed`]. Opaque outside the backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingRef(pub u64);

/// Configuration for creating a paged KV cache.
#[derive(Debug, Clone, PartialEq)]
pub struct KvConfig {
    /// Tokens per page.
    pub page_size: usize,
    /// The model's context window in tokens.
    pub context_window_size: usize,
    /// Sliding-window size; `None` disables sliding-window attention.
    pub sliding_window_size: Option<usize>,
}

/// The paged KV-state builtins exported by the model library.
pub trait KvBackend: Send {
    /// Remove every sequence.
    fn clear(&mut self);
    /// Add a sequence.
    fn add_sequence(&mut self, seq_id: i64);
    /// Remove a sequence.
    fn remove_sequence(&mut self, seq_id: i64);
    /// Open a forward scope appending `length` positions to `seq_id`.
    fn begin_forward(&mut self, seq_id: i64, length: usize);
    /// Close the current forward scope.
    fn end_forward(&mut self);
    /// Drop the last `count` tokens of `seq_id`.
    fn popn(&mut self, seq_id: i64, count: usize);
    /// Pages still free.
    fn available_pages(&self) -> usize;
    /// Committed length of `seq_id`.
    fn total_sequence_length(&self, seq_id: i64) -> usize;
}

/// The packed-function surface of a compiled model library.
///
/// `decode` retains the last-position logits backend-side; `apply_bitmask`
/// and `sample_top_p` operate on those retained logits, which mirrors how
/// the device kernels chain without round-tripping tensors through the
/// host.
pub trait ModelBackend: Send {
    /// Vocabulary size of the model head.
    fn vocab_size(&self) -> usize;

    /// Create the paged KV cache this model was compiled against.
    fn create_kv_cache(&self, config: &KvConfig) -> Result<Box<dyn KvBackend>, EngineError>;

    /// Upload `tokens` and compute their embeddings.
    fn embed(&mut self, tokens: &[u32]) -> Result<EmbeddingRef, EngineError>;

    /// Run the prefill kernel over an embedded chunk inside the currently
    /// open forward scope.
    fn prefill(&mut self, embedding: EmbeddingRef, kv: &mut dyn KvBackend)
    -> Result<(), EngineError>;

    /// Run the single-token decode kernel, retaining the output logits.
    fn decode(&mut self, embedding: EmbeddingRef, kv: &mut dyn KvBackend)
    -> Result<(), EngineError>;

    /// Mask the retained logits in place: cleared bits become `-inf`.
    fn apply_bitmask(&mut self, bitmask: &[u32]) -> Result<(), EngineError>;

    /// Wait for outstanding device work before host-side sampling.
    fn sync(&mut self) -> Result<(), EngineError>;

    /// Top-p sample from the retained logits with the given uniform
    /// random draw.
    fn sample_top_p(&mut self, temperature: f32, top_p: f32, random: f64)
    -> Result<u32, EngineError>;
}

/// Compiles grammars against the model's tokenizer info.
///
/// A grammar is compiled once; a fresh [`GrammarMatcher`] is created on
/// every transition into the stream mode it is bound to.
pub trait GrammarCompiler: Send + Sync {
    /// The builtin JSON grammar.
    fn compile_json(&self) -> Result<Arc<dyn Grammar>, EngineError>;
    /// A grammar constraining output to a JSON schema.
    fn compile_json_schema(&self, schema: &str) -> Result<Arc<dyn Grammar>, EngineError>;
    /// A grammar constraining output to a regular expression.
    fn compile_regex(&self, pattern: &str) -> Result<Arc<dyn Grammar>, EngineError>;
    /// A grammar from EBNF source.
    fn compile_ebnf(&self, source: &str) -> Result<Arc<dyn Grammar>, EngineError>;
}

/// A compiled grammar.
pub trait Grammar: Send + Sync {
    /// Create a matcher that additionally terminates on `stop_tokens`.
    fn new_matcher(&self, stop_tokens: &[u32]) -> Box<dyn GrammarMatcher>;
}

/// Tracks a partial derivation and constrains the next token.
pub trait GrammarMatcher: Send {
    /// Set the allowed-token bits. The mask holds `ceil(vocab/32)` words;
    /// bit `i % 32` of word `i / 32` covers token `i`.
    fn fill_bitmask(&mut self, bitmask: &mut [u32]);
    /// Advance the derivation by one token. `false` if the token was not
    /// permitted.
    fn accept(&mut self, token: u32) -> bool;
    /// True once the derivation (or a stop token) completed.
    fn is_terminated(&self) -> bool;
}

/// Words needed for a vocabulary bitmask.
pub fn bitmask_words(vocab_size: usize) -> usize {
    vocab_size.div_ceil(32)
}

/// Test whether `token` is allowed by `bitmask`.
pub fn bitmask_allows(bitmask: &[u32], token: u32) -> bool {
    let index = token as usize;
    bitmask
        .get(index / 32)
        .map(|word| word & (1 << (index % 32)) != 0)
        .unwrap_or(false)
}
