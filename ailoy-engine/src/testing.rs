//! Mock implementations of the engine's seams, for tests and hosts
//! without a tensor runtime.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::backend::{
    EmbeddingRef, Grammar, GrammarCompiler, GrammarMatcher, KvBackend, KvConfig, ModelBackend,
    bitmask_allows,
};
use crate::config::{ModelConfig, TemplateConfig};
use crate::engine::LocalEngine;
use crate::error::EngineError;
use crate::template::ChatTemplate;
use crate::tokenizer::Tokenizer;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tokenizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Byte-level mock tokenizer with optional multi-byte special pieces.
pub struct MockTokenizer {
    pieces: Vec<Vec<u8>>,
}

impl MockTokenizer {
    /// A vocabulary of exactly the given byte pieces, ids in order.
    pub fn byte_vocab(pieces: &[&[u8]]) -> Self {
        Self {
            pieces: pieces.iter().map(|p| p.to_vec()).collect(),
        }
    }

    /// A vocabulary of exactly the given word pieces, ids in order.
    pub fn word_vocab(words: &[&str]) -> Self {
        Self {
            pieces: words.iter().map(|w| w.as_bytes().to_vec()).collect(),
        }
    }

    /// All 256 single bytes (ids 0–255) plus the given specials.
    pub fn ascii_with_specials(specials: &[&str]) -> Self {
        let mut pieces: Vec<Vec<u8>> = (0u16..256).map(|b| vec![b as u8]).collect();
        pieces.extend(specials.iter().map(|s| s.as_bytes().to_vec()));
        Self { pieces }
    }
}

impl Tokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        let bytes = text.as_bytes();
        let mut ids = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let mut best: Option<(usize, usize)> = None;
            for (id, piece) in self.pieces.iter().enumerate() {
                if !piece.is_empty()
                    && bytes[at..].starts_with(piece)
                    && best.map(|(_, len)| piece.len() > len).unwrap_or(true)
                {
                    best = Some((id, piece.len()));
                }
            }
            let (id, len) = best.ok_or_else(|| {
                EngineError::Tokenizer(format!("no piece matches at byte {at}"))
            })?;
            ids.push(id as u32);
            at += len;
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], _skip_special: bool) -> Result<String, EngineError> {
        let mut bytes = Vec::new();
        for &id in ids {
            let piece = self
                .pieces
                .get(id as usize)
                .ok_or_else(|| EngineError::Tokenizer(format!("unknown token {id}")))?;
            bytes.extend_from_slice(piece);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    fn id_to_piece(&self, id: u32) -> Option<String> {
        self.pieces
            .get(id as usize)
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    fn token_to_id(&self, piece: &str) -> Option<u32> {
        self.pieces
            .iter()
            .position(|p| p == piece.as_bytes())
            .map(|id| id as u32)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KV cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters shared with tests while a [`MockKv`] is owned by the engine.
#[derive(Debug, Default)]
pub struct KvProbe {
    scopes: AtomicIsize,
    ops: StdMutex<Vec<String>>,
}

impl KvProbe {
    /// Currently open forward scopes. Zero after well-behaved operation.
    pub fn open_forward_scopes(&self) -> isize {
        self.scopes.load(Ordering::SeqCst)
    }

    /// The operation log, e.g. `["forward:5", "popn:2"]`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().expect("probe poisoned").clone()
    }

    /// Sizes of every `popn` call, in order.
    pub fn popn_sizes(&self) -> Vec<usize> {
        self.ops()
            .iter()
            .filter_map(|op| op.strip_prefix("popn:").and_then(|n| n.parse().ok()))
            .collect()
    }

    /// Total tokens pushed through forward scopes.
    pub fn forwarded_tokens(&self) -> usize {
        self.ops()
            .iter()
            .filter_map(|op| op.strip_prefix("forward:").and_then(|n| n.parse::<usize>().ok()))
            .sum()
    }

    fn log(&self, op: String) {
        self.ops.lock().expect("probe poisoned").push(op);
    }
}

/// In-memory KV builtins with page accounting.
pub struct MockKv {
    pages_total: usize,
    page_size: usize,
    sequences: HashMap<i64, usize>,
    probe: Arc<KvProbe>,
}

impl MockKv {
    /// A cache with `pages_total` pages of `page_size` tokens.
    pub fn new(pages_total: usize, page_size: usize) -> Self {
        Self {
            pages_total,
            page_size,
            sequences: HashMap::new(),
            probe: Arc::new(KvProbe::default()),
        }
    }

    /// Share the probe before handing the cache to an engine.
    pub fn probe(&self) -> Arc<KvProbe> {
        Arc::clone(&self.probe)
    }
}

impl KvBackend for MockKv {
    fn clear(&mut self) {
        self.sequences.clear();
        self.probe.log("clear".into());
    }

    fn add_sequence(&mut self, seq_id: i64) {
        self.sequences.insert(seq_id, 0);
        self.probe.log(format!("add:{seq_id}"));
    }

    fn remove_sequence(&mut self, seq_id: i64) {
        self.sequences.remove(&seq_id);
        self.probe.log(format!("remove:{seq_id}"));
    }

    fn begin_forward(&mut self, seq_id: i64, length: usize) {
        *self.sequences.entry(seq_id).or_default() += length;
        self.probe.scopes.fetch_add(1, Ordering::SeqCst);
        self.probe.log(format!("forward:{length}"));
    }

    fn end_forward(&mut self) {
        self.probe.scopes.fetch_sub(1, Ordering::SeqCst);
    }

    fn popn(&mut self, seq_id: i64, count: usize) {
        if let Some(len) = self.sequences.get_mut(&seq_id) {
            *len = len.saturating_sub(count);
        }
        self.probe.log(format!("popn:{count}"));
    }

    fn available_pages(&self) -> usize {
        let used: usize = self
            .sequences
            .values()
            .map(|len| len.div_ceil(self.page_size))
            .sum();
        self.pages_total.saturating_sub(used)
    }

    fn total_sequence_length(&self, seq_id: i64) -> usize {
        self.sequences.get(&seq_id).copied().unwrap_or(0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters shared with tests while a [`MockBackend`] is owned by the
/// engine.
#[derive(Debug, Default)]
pub struct BackendProbe {
    prefill_chunks: StdMutex<Vec<usize>>,
    decode_steps: AtomicUsize,
    masks: StdMutex<Vec<Vec<u32>>>,
    masked_samples_allowed: StdMutex<Vec<bool>>,
    kv: StdMutex<Option<Arc<KvProbe>>>,
}

impl BackendProbe {
    /// Chunk sizes prefilled, in order.
    pub fn prefill_chunks(&self) -> Vec<usize> {
        self.prefill_chunks.lock().expect("probe poisoned").clone()
    }

    /// Decode steps taken.
    pub fn decode_steps(&self) -> usize {
        self.decode_steps.load(Ordering::SeqCst)
    }

    /// Every bitmask applied to the logits, in order.
    pub fn masks(&self) -> Vec<Vec<u32>> {
        self.masks.lock().expect("probe poisoned").clone()
    }

    /// For each masked sampling step: whether the sampled token was
    /// allowed by the mask.
    pub fn masked_samples_allowed(&self) -> Vec<bool> {
        self.masked_samples_allowed
            .lock()
            .expect("probe poisoned")
            .clone()
    }

    /// Probe of the KV cache this backend created, once the engine built
    /// one.
    pub fn kv(&self) -> Option<Arc<KvProbe>> {
        self.kv.lock().expect("probe poisoned").clone()
    }
}

/// A scripted model: `sample_top_p` replays a fixed token sequence.
pub struct MockBackend {
    vocab: usize,
    script: VecDeque<u32>,
    embeddings: HashMap<u64, usize>,
    next_embedding: u64,
    pending_mask: Option<Vec<u32>>,
    probe: Arc<BackendProbe>,
}

impl MockBackend {
    /// A backend over `vocab` tokens replaying `script`.
    pub fn new(vocab: usize, script: Vec<u32>) -> Self {
        Self {
            vocab,
            script: script.into(),
            embeddings: HashMap::new(),
            next_embedding: 0,
            pending_mask: None,
            probe: Arc::new(BackendProbe::default()),
        }
    }

    /// Share the probe before handing the backend to an engine.
    pub fn probe(&self) -> Arc<BackendProbe> {
        Arc::clone(&self.probe)
    }
}

impl ModelBackend for MockBackend {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn create_kv_cache(&self, config: &KvConfig) -> Result<Box<dyn KvBackend>, EngineError> {
        let pages = config.context_window_size.div_ceil(config.page_size);
        let kv = MockKv::new(pages, config.page_size);
        *self.probe.kv.lock().expect("probe poisoned") = Some(kv.probe());
        Ok(Box::new(kv))
    }

    fn embed(&mut self, tokens: &[u32]) -> Result<EmbeddingRef, EngineError> {
        let id = self.next_embedding;
        self.next_embedding += 1;
        self.embeddings.insert(id, tokens.len());
        Ok(EmbeddingRef(id))
    }

    fn prefill(
        &mut self,
        embedding: EmbeddingRef,
        _kv: &mut dyn KvBackend,
    ) -> Result<(), EngineError> {
        let len = self
            .embeddings
            .remove(&embedding.0)
            .ok_or_else(|| EngineError::Backend("unknown embedding".into()))?;
        self.probe
            .prefill_chunks
            .lock()
            .expect("probe poisoned")
            .push(len);
        Ok(())
    }

    fn decode(
        &mut self,
        embedding: EmbeddingRef,
        _kv: &mut dyn KvBackend,
    ) -> Result<(), EngineError> {
        self.embeddings
            .remove(&embedding.0)
            .ok_or_else(|| EngineError::Backend("unknown embedding".into()))?;
        self.probe.decode_steps.fetch_add(1, Ordering::SeqCst);
        self.pending_mask = None;
        Ok(())
    }

    fn apply_bitmask(&mut self, bitmask: &[u32]) -> Result<(), EngineError> {
        self.probe
            .masks
            .lock()
            .expect("probe poisoned")
            .push(bitmask.to_vec());
        self.pending_mask = Some(bitmask.to_vec());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn sample_top_p(
        &mut self,
        _temperature: f32,
        _top_p: f32,
        _random: f64,
    ) -> Result<u32, EngineError> {
        let token = self
            .script
            .pop_front()
            .ok_or_else(|| EngineError::Backend("sample script exhausted".into()))?;
        if let Some(mask) = self.pending_mask.take() {
            self.probe
                .masked_samples_allowed
                .lock()
                .expect("probe poisoned")
                .push(bitmask_allows(&mask, token));
        }
        Ok(token)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Grammar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Grammar that permits every token and terminates on its stop tokens.
pub struct PermissiveGrammar;

impl Grammar for PermissiveGrammar {
    fn new_matcher(&self, stop_tokens: &[u32]) -> Box<dyn GrammarMatcher> {
        Box::new(PermissiveMatcher {
            stops: stop_tokens.to_vec(),
            terminated: false,
        })
    }
}

struct PermissiveMatcher {
    stops: Vec<u32>,
    terminated: bool,
}

impl GrammarMatcher for PermissiveMatcher {
    fn fill_bitmask(&mut self, bitmask: &mut [u32]) {
        bitmask.fill(u32::MAX);
    }

    fn accept(&mut self, token: u32) -> bool {
        if self.stops.contains(&token) {
            self.terminated = true;
        }
        true
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Grammar that permits only an explicit token set (plus stop tokens).
pub struct AllowListGrammar {
    allowed: Vec<u32>,
}

impl AllowListGrammar {
    /// Allow exactly `allowed`.
    pub fn new(allowed: Vec<u32>) -> Self {
        Self { allowed }
    }
}

impl Grammar for AllowListGrammar {
    fn new_matcher(&self, stop_tokens: &[u32]) -> Box<dyn GrammarMatcher> {
        let mut allowed = self.allowed.clone();
        allowed.extend_from_slice(stop_tokens);
        Box::new(AllowListMatcher {
            allowed,
            stops: stop_tokens.to_vec(),
            terminated: false,
        })
    }
}

struct AllowListMatcher {
    allowed: Vec<u32>,
    stops: Vec<u32>,
    terminated: bool,
}

impl GrammarMatcher for AllowListMatcher {
    fn fill_bitmask(&mut self, bitmask: &mut [u32]) {
        bitmask.fill(0);
        for &token in &self.allowed {
            let index = token as usize;
            if let Some(word) = bitmask.get_mut(index / 32) {
                *word |= 1 << (index % 32);
            }
        }
    }

    fn accept(&mut self, token: u32) -> bool {
        if self.stops.contains(&token) {
            self.terminated = true;
        }
        self.allowed.contains(&token)
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Compiler returning permissive grammars for every source.
pub struct MockGrammarCompiler;

impl GrammarCompiler for MockGrammarCompiler {
    fn compile_json(&self) -> Result<Arc<dyn Grammar>, EngineError> {
        Ok(Arc::new(PermissiveGrammar))
    }

    fn compile_json_schema(&self, _schema: &str) -> Result<Arc<dyn Grammar>, EngineError> {
        Ok(Arc::new(PermissiveGrammar))
    }

    fn compile_regex(&self, _pattern: &str) -> Result<Arc<dyn Grammar>, EngineError> {
        Ok(Arc::new(PermissiveGrammar))
    }

    fn compile_ebnf(&self, _source: &str) -> Result<Arc<dyn Grammar>, EngineError> {
        Ok(Arc::new(PermissiveGrammar))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Special pieces every fixture vocabulary carries.
pub const FIXTURE_SPECIALS: &[&str] = &[
    "<think>",
    "</think>",
    "<tool_call>",
    "</tool_call>",
    "<|im_end|>",
];

/// Minimal ChatML-flavored template used by fixtures.
pub const TEST_TEMPLATE: &str = r#"{% for m in messages %}<|im_start|>{{ m.role }}
{% if m.content is string %}{{ m.content }}{% endif %}<|im_end|>
{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant
{% endif %}"#;

/// One piece of a scripted model output.
#[derive(Debug, Clone, Copy)]
pub enum ScriptPiece<'a> {
    /// Plain text, encoded with the fixture tokenizer.
    Text(&'a str),
    /// A special piece by its exact text.
    Special(&'a str),
    /// Raw bytes (for multi-byte split tests).
    Bytes(&'a [u8]),
    /// The end-of-sequence token.
    Eos,
}

/// A ready-to-decode engine over mocks, with its probes.
pub struct EngineFixture {
    /// The engine under test.
    pub engine: LocalEngine,
    /// Backend counters.
    pub probe: Arc<BackendProbe>,
}

impl EngineFixture {
    /// Build a fixture whose model will emit `script`, then whatever the
    /// test drives.
    pub fn with_script(script: &[ScriptPiece<'_>]) -> Self {
        Self::build(script, 4096)
    }

    /// Fixture with a 64-token context window (four 16-token pages).
    pub fn tiny_context() -> Self {
        Self::build(&[ScriptPiece::Eos], 64)
    }

    fn build(script: &[ScriptPiece<'_>], context_window: usize) -> Self {
        let tokenizer = Arc::new(MockTokenizer::ascii_with_specials(FIXTURE_SPECIALS));
        let tokens = script_tokens(tokenizer.as_ref(), script);

        let backend = MockBackend::new(tokenizer.vocab_size(), tokens);
        let probe = backend.probe();

        let template = ChatTemplate::new(
            TEST_TEMPLATE.to_owned(),
            TemplateConfig {
                template_file: "chat-template.j2".into(),
                bos_token: String::new(),
                eos_token: "<|im_end|>".into(),
                botc_token: Some("<tool_call>".into()),
                eotc_token: Some("</tool_call>".into()),
            },
        )
        .expect("fixture template");

        let model_config: ModelConfig = serde_json::from_str(&format!(
            r#"{{
                "temperature": 0.0,
                "top_p": 1.0,
                "context_window_size": {context_window},
                "sliding_window_size": -1,
                "prefill_chunk_size": 32
            }}"#
        ))
        .expect("fixture config");

        let engine = LocalEngine::new(
            Box::new(backend),
            tokenizer,
            template,
            Arc::new(MockGrammarCompiler),
            &model_config,
        )
        .expect("fixture engine")
        .with_seed(7);

        Self { engine, probe }
    }
}

/// Encode a script into the token ids the mock backend will replay.
pub fn script_tokens(tokenizer: &dyn Tokenizer, script: &[ScriptPiece<'_>]) -> Vec<u32> {
    let mut tokens = Vec::new();
    for piece in script {
        match piece {
            ScriptPiece::Text(text) => {
                tokens.extend(tokenizer.encode(text).expect("script text encodes"));
            }
            ScriptPiece::Special(piece) => {
                tokens.push(
                    tokenizer
                        .token_to_id(piece)
                        .unwrap_or_else(|| panic!("unknown special {piece}")),
                );
            }
            ScriptPiece::Bytes(bytes) => {
                for &byte in *bytes {
                    tokens.push(byte as u32);
                }
            }
            ScriptPiece::Eos => {
                tokens.push(tokenizer.token_to_id("<|im_end|>").expect("eos piece"));
            }
        }
    }
    tokens
}
