//! The tokenizer seam and its Hugging Face implementation.

use std::path::Path;
use std::sync::Arc;

use crate::error::EngineError;

/// What the engine needs from a tokenizer.
pub trait Tokenizer: Send + Sync {
    /// Text to token ids, without special-token wrapping.
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError>;
    /// Token ids back to text.
    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String, EngineError>;
    /// Vocabulary size.
    fn vocab_size(&self) -> usize;
    /// The piece string of one token id.
    fn id_to_piece(&self, id: u32) -> Option<String>;
    /// Look up the id of an exact piece, e.g. a special token.
    fn token_to_id(&self, piece: &str) -> Option<u32>;
}

/// Tokenizer backed by a `tokenizer.json` file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load from a `tokenizer.json`.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String, EngineError> {
        self.inner
            .decode(ids, skip_special)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn id_to_piece(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        self.inner.token_to_id(piece)
    }
}

/// Multi-byte-safe incremental detokenization.
///
/// Tokens are buffered until the decoded text no longer ends with the
/// Unicode replacement character, so a code point split across tokens is
/// never emitted half-finished.
pub struct IncrementalDetokenizer {
    tokenizer: Arc<dyn Tokenizer>,
    pending: Vec<u32>,
}

impl IncrementalDetokenizer {
    /// A fresh detokenizer over `tokenizer`.
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            pending: Vec::new(),
        }
    }

    /// Feed one token; returns the text ready to emit, if any.
    ///
    /// The last `withhold` buffered tokens are never flushed; the caller
    /// uses this for tokens that may turn out to be a mode indicator.
    pub fn push(&mut self, token: u32, withhold: usize) -> Result<Option<String>, EngineError> {
        self.pending.push(token);
        let flushable = self.pending.len().saturating_sub(withhold);
        if flushable == 0 {
            return Ok(None);
        }
        let text = self.tokenizer.decode(&self.pending[..flushable], false)?;
        if text.is_empty() || text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        self.pending.drain(..flushable);
        Ok(Some(text))
    }

    /// Drop the last `count` buffered tokens (e.g. a mode indicator that
    /// must not be emitted).
    pub fn retract(&mut self, count: usize) {
        let keep = self.pending.len().saturating_sub(count);
        self.pending.truncate(keep);
    }

    /// Tokens currently buffered.
    pub fn pending(&self) -> &[u32] {
        &self.pending
    }

    /// Forget everything buffered.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTokenizer;

    #[test]
    fn flushes_complete_text_immediately() {
        let tokenizer = Arc::new(MockTokenizer::word_vocab(&["Hello", " world"]));
        let mut detok = IncrementalDetokenizer::new(tokenizer.clone());
        let hello = tokenizer.token_to_id("Hello").unwrap();
        assert_eq!(detok.push(hello, 0).unwrap().as_deref(), Some("Hello"));
    }

    #[test]
    fn buffers_split_code_points() {
        // "é" is 0xC3 0xA9; two byte-level tokens.
        let tokenizer = Arc::new(MockTokenizer::byte_vocab(&[&[0xC3], &[0xA9]]));
        let mut detok = IncrementalDetokenizer::new(tokenizer);
        assert_eq!(detok.push(0, 0).unwrap(), None);
        assert_eq!(detok.push(1, 0).unwrap().as_deref(), Some("é"));
    }

    #[test]
    fn withheld_tokens_are_not_flushed() {
        let tokenizer = Arc::new(MockTokenizer::word_vocab(&["Hello", " world"]));
        let mut detok = IncrementalDetokenizer::new(tokenizer.clone());
        let hello = tokenizer.token_to_id("Hello").unwrap();
        let world = tokenizer.token_to_id(" world").unwrap();
        // The trailing token is a potential indicator prefix.
        assert_eq!(detok.push(hello, 1).unwrap(), None);
        assert_eq!(detok.push(world, 1).unwrap().as_deref(), Some("Hello"));
        assert_eq!(detok.pending(), &[world]);
    }

    #[test]
    fn retract_drops_withheld_tokens() {
        let tokenizer = Arc::new(MockTokenizer::byte_vocab(&[&[0xC3], &[0xA9]]));
        let mut detok = IncrementalDetokenizer::new(tokenizer);
        detok.push(0, 1).unwrap();
        detok.retract(1);
        assert!(detok.pending().is_empty());
    }
}
