//! The local decode engine.
//!
//! Owns the model backend, the paged KV cache, the tokenizer, the chat
//! template, and the stream-mode registry. Prefill reuses the longest
//! common prefix with the previous prompt; decode runs token by token with
//! top-p sampling, optionally constrained by the current mode's grammar
//! matcher.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::debug;

use ailoy_cache::ModelArtifacts;

use crate::backend::{
    Grammar, GrammarCompiler, GrammarMatcher, KvConfig, ModelBackend, bitmask_words,
};
use crate::config::{ModelConfig, SamplingConfig, TemplateConfig};
use crate::error::EngineError;
use crate::kv::PagedKvCache;
use crate::modes::{ModeRegistry, REASONING, StreamMode, TOOL_CALL, Transition};
use crate::template::ChatTemplate;
use crate::tokenizer::{HfTokenizer, Tokenizer};

/// Binds a compiled model library: loads packed functions, registers the
/// parameter cache, and exposes the grammar engine compiled against the
/// model's tokenizer info.
pub trait BackendLoader: Send + Sync {
    /// Load the model named by `artifacts`.
    fn load(
        &self,
        artifacts: &ModelArtifacts,
    ) -> Result<(Box<dyn ModelBackend>, Arc<dyn GrammarCompiler>), EngineError>;
}

/// One decode step's outcome.
pub struct StepOutcome {
    /// The sampled token.
    pub token: u32,
    /// The mode switch this token caused, if any.
    pub transition: Option<Transition>,
}

/// The local LLM decode engine.
pub struct LocalEngine {
    backend: Box<dyn ModelBackend>,
    kv: PagedKvCache,
    tokenizer: Arc<dyn Tokenizer>,
    template: ChatTemplate,
    grammar_compiler: Arc<dyn GrammarCompiler>,
    modes: ModeRegistry,
    matcher: Option<Box<dyn GrammarMatcher>>,
    history: Vec<u32>,
    config: SamplingConfig,
    default_config: SamplingConfig,
    eos_token: u32,
    prefill_chunk_size: usize,
    rng: StdRng,
}

impl LocalEngine {
    /// Assemble an engine from its parts.
    ///
    /// Registers the default stream modes: `output_text`, `reasoning`
    /// (`<think>`/`</think>`), and, when the template config carries
    /// tool-call tokens, `tool_call` with the builtin JSON grammar bound.
    pub fn new(
        backend: Box<dyn ModelBackend>,
        tokenizer: Arc<dyn Tokenizer>,
        template: ChatTemplate,
        grammar_compiler: Arc<dyn GrammarCompiler>,
        model_config: &ModelConfig,
    ) -> Result<Self, EngineError> {
        let kv_backend = backend.create_kv_cache(&KvConfig {
            page_size: model_config.page_size,
            context_window_size: model_config.context_window_size,
            sliding_window_size: model_config.sliding_window(),
        })?;
        let kv = PagedKvCache::new(
            kv_backend,
            KvConfig {
                page_size: model_config.page_size,
                context_window_size: model_config.context_window_size,
                sliding_window_size: model_config.sliding_window(),
            },
        );

        let template_config = template.config().clone();
        let eos_token = indicator_tokens(tokenizer.as_ref(), &template_config.eos_token)?
            .first()
            .copied()
            .ok_or_else(|| {
                EngineError::Artifact(format!(
                    "eos token {:?} is not in the vocabulary",
                    template_config.eos_token
                ))
            })?;

        let sampling = model_config.sampling();
        let mut engine = Self {
            backend,
            kv,
            tokenizer,
            template,
            grammar_compiler,
            modes: ModeRegistry::new(),
            matcher: None,
            history: Vec::new(),
            config: sampling,
            default_config: sampling,
            eos_token,
            prefill_chunk_size: model_config.prefill_chunk_size,
            rng: StdRng::from_entropy(),
        };
        engine.register_default_modes(&template_config)?;
        Ok(engine)
    }

    /// Creation pipeline over resolved cache artifacts: verify shard
    /// sizes, bind the library, load tokenizer + template + config.
    pub fn load(
        artifacts: &ModelArtifacts,
        loader: &dyn BackendLoader,
    ) -> Result<Self, EngineError> {
        verify_shard_sizes(&artifacts.model_dir)?;
        let (backend, grammar_compiler) = loader.load(artifacts)?;
        let tokenizer: Arc<dyn Tokenizer> =
            Arc::new(HfTokenizer::from_file(&artifacts.model_dir.join("tokenizer.json"))?);
        let template_config =
            TemplateConfig::from_file(&artifacts.model_dir.join("chat-template-config.json"))?;
        let template = ChatTemplate::from_dir(&artifacts.model_dir, template_config)?;
        let model_config =
            ModelConfig::from_file(&artifacts.model_dir.join("mlc-chat-config.json"))?;
        Self::new(backend, tokenizer, template, grammar_compiler, &model_config)
    }

    fn register_default_modes(&mut self, config: &TemplateConfig) -> Result<(), EngineError> {
        let open = indicator_tokens(self.tokenizer.as_ref(), "<think>")?;
        let close = indicator_tokens(self.tokenizer.as_ref(), "</think>")?;
        if !open.is_empty() && !close.is_empty() {
            self.modes.register(
                REASONING,
                StreamMode {
                    open_indicator: open,
                    close_indicator: close,
                    grammar: None,
                },
            )?;
        }
        if let (Some(botc), Some(eotc)) = (&config.botc_token, &config.eotc_token) {
            let open = indicator_tokens(self.tokenizer.as_ref(), botc)?;
            let close = indicator_tokens(self.tokenizer.as_ref(), eotc)?;
            self.modes.register(
                TOOL_CALL,
                StreamMode {
                    open_indicator: open,
                    close_indicator: close,
                    grammar: Some(self.grammar_compiler.compile_json()?),
                },
            )?;
        }
        Ok(())
    }

    /// Seed the sampler deterministically (tests, reproduction).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// The tokenizer this engine decodes with.
    pub fn tokenizer(&self) -> Arc<dyn Tokenizer> {
        Arc::clone(&self.tokenizer)
    }

    /// The end-of-sequence token id.
    pub fn eos_token(&self) -> u32 {
        self.eos_token
    }

    /// Token history mirroring the KV cache.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    /// The KV cache, for inspection.
    pub fn kv(&self) -> &PagedKvCache {
        &self.kv
    }

    /// The current stream mode name.
    pub fn current_mode(&self) -> &str {
        self.modes.current()
    }

    /// Current sampling parameters.
    pub fn sampling_config(&self) -> SamplingConfig {
        self.config
    }

    /// Override sampling parameters.
    pub fn set_sampling_config(&mut self, config: SamplingConfig) {
        self.config = config;
    }

    /// Restore the sampling parameters the model shipped with.
    pub fn reset_sampling_config(&mut self) {
        self.config = self.default_config;
    }

    /// Register an additional stream mode from indicator strings.
    pub fn register_mode(
        &mut self,
        name: &str,
        open_indicator: &str,
        close_indicator: &str,
    ) -> Result<(), EngineError> {
        let open = indicator_tokens(self.tokenizer.as_ref(), open_indicator)?;
        let close = indicator_tokens(self.tokenizer.as_ref(), close_indicator)?;
        self.modes.register(
            name,
            StreamMode {
                open_indicator: open,
                close_indicator: close,
                grammar: None,
            },
        )
    }

    /// Bind a pre-compiled grammar to a mode.
    pub fn bind_grammar(&mut self, mode: &str, grammar: Arc<dyn Grammar>) -> Result<(), EngineError> {
        self.modes.set_grammar(mode, grammar)
    }

    /// Bind a builtin grammar (`"json"`) to a mode.
    pub fn set_builtin_grammar(&mut self, mode: &str, kind: &str) -> Result<(), EngineError> {
        let grammar = match kind {
            "json" => self.grammar_compiler.compile_json()?,
            other => {
                return Err(EngineError::InvalidInput(format!(
                    "unknown builtin grammar {other}"
                )));
            }
        };
        self.modes.set_grammar(mode, grammar)
    }

    /// Bind a JSON-schema grammar to a mode.
    pub fn set_json_schema_grammar(&mut self, mode: &str, schema: &str) -> Result<(), EngineError> {
        let grammar = self.grammar_compiler.compile_json_schema(schema)?;
        self.modes.set_grammar(mode, grammar)
    }

    /// Bind a regex grammar to a mode.
    pub fn set_regex_grammar(&mut self, mode: &str, pattern: &str) -> Result<(), EngineError> {
        let grammar = self.grammar_compiler.compile_regex(pattern)?;
        self.modes.set_grammar(mode, grammar)
    }

    /// Bind an EBNF grammar to a mode.
    pub fn set_ebnf_grammar(&mut self, mode: &str, source: &str) -> Result<(), EngineError> {
        let grammar = self.grammar_compiler.compile_ebnf(source)?;
        self.modes.set_grammar(mode, grammar)
    }

    /// Drop a mode's grammar binding.
    pub fn reset_grammar(&mut self, mode: &str) -> Result<(), EngineError> {
        self.modes.reset_grammar(mode)
    }

    /// Render the prompt for a conversation and encode it.
    pub fn encode_prompt(
        &self,
        messages: &[ailoy_types::Message],
        tools: &[ailoy_types::ToolDesc],
        reasoning: bool,
    ) -> Result<Vec<u32>, EngineError> {
        let prompt = self.template.apply(messages, Some(tools), reasoning, true)?;
        self.tokenizer.encode(&prompt)
    }

    /// Populate the KV cache for `tokens`, reusing the longest common
    /// prefix with the current history. Returns the last prompt token.
    pub fn prefill(&mut self, tokens: &[u32]) -> Result<u32, EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::InvalidInput("empty prompt".into()));
        }

        // A desynced cache cannot be patched incrementally.
        if self.kv.total_sequence_length() != self.history.len() {
            self.kv.clear();
            self.history.clear();
        }

        let lcp = self
            .history
            .iter()
            .zip(tokens.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if lcp < self.history.len() {
            self.kv.popn(self.history.len() - lcp);
            self.history.truncate(lcp);
        }

        let new = &tokens[lcp..];
        if new.is_empty() {
            // The cache already holds this prompt; history equals it after
            // the truncation above, and stream-mode state stays as-is.
            return Ok(tokens[tokens.len() - 1]);
        }
        if new.len() >= self.kv.available_pages() * self.kv.page_size() {
            return Err(EngineError::ContextLengthLimit);
        }

        for chunk in new.chunks(self.prefill_chunk_size) {
            let backend = &mut self.backend;
            let embedding = backend.embed(chunk)?;
            self.kv
                .forward(chunk.len(), |kv| backend.prefill(embedding, kv))?;
        }
        debug!(reused = lcp, appended = new.len(), "prefill complete");

        self.history = tokens.to_vec();
        self.modes.reset_current();
        self.matcher = None;
        Ok(tokens[tokens.len() - 1])
    }

    /// One decode step: consume `last_token`, sample the next token,
    /// advance the grammar matcher, and evaluate mode transitions.
    pub fn decode_step(&mut self, last_token: u32) -> Result<StepOutcome, EngineError> {
        if self.kv.available_pages() < 1 {
            return Err(EngineError::ContextLengthLimit);
        }

        let backend = &mut self.backend;
        let embedding = backend.embed(&[last_token])?;
        self.kv
            .forward(1, |kv| backend.decode(embedding, kv))?;

        if let Some(matcher) = &mut self.matcher {
            let mut bitmask = vec![0u32; bitmask_words(self.backend.vocab_size())];
            matcher.fill_bitmask(&mut bitmask);
            self.backend.apply_bitmask(&bitmask)?;
        }

        // Device sync before host-side sampling.
        self.backend.sync()?;
        let random = self.rng.gen_range(0.0..1.0);
        let token = self
            .backend
            .sample_top_p(self.config.temperature, self.config.top_p, random)?;
        self.history.push(token);

        if let Some(matcher) = &mut self.matcher {
            matcher.accept(token);
            if matcher.is_terminated() {
                self.matcher = None;
            }
        }

        let transition = self.modes.transition(&self.history);
        if let Some(Transition::Entered {
            grammar,
            close_indicator,
            ..
        }) = &transition
        {
            self.matcher = grammar
                .as_ref()
                .map(|g| g.new_matcher(close_indicator));
        }
        if let Some(Transition::Exited { .. }) = &transition {
            self.matcher = None;
        }

        Ok(StepOutcome { token, transition })
    }

    /// Tokens currently withheld from emission because they may complete a
    /// mode indicator.
    pub(crate) fn withhold_len(&self) -> usize {
        self.modes.withhold_len(&self.history)
    }
}

/// Token sequence of an indicator or special-token string: the exact
/// special token when the vocabulary has one, else the encoded sequence.
pub fn indicator_tokens(tokenizer: &dyn Tokenizer, text: &str) -> Result<Vec<u32>, EngineError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(id) = tokenizer.token_to_id(text) {
        return Ok(vec![id]);
    }
    tokenizer.encode(text)
}

#[derive(Debug, Deserialize)]
struct NdarrayCache {
    records: Vec<NdarrayRecord>,
}

#[derive(Debug, Deserialize)]
struct NdarrayRecord {
    #[serde(rename = "dataPath")]
    data_path: String,
    nbytes: u64,
}

/// Verify parameter shard sizes against `ndarray-cache.json`, in manifest
/// order. Missing metadata is tolerated; a size mismatch is not.
pub(crate) fn verify_shard_sizes(model_dir: &Path) -> Result<(), EngineError> {
    let path = model_dir.join("ndarray-cache.json");
    if !path.exists() {
        return Ok(());
    }
    let text = std::fs::read_to_string(&path)?;
    let cache: NdarrayCache = serde_json::from_str(&text)
        .map_err(|e| EngineError::Artifact(format!("{}: {e}", path.display())))?;
    for record in &cache.records {
        let shard = model_dir.join(&record.data_path);
        let len = std::fs::metadata(&shard)
            .map_err(|_| EngineError::Artifact(format!("missing shard {}", record.data_path)))?
            .len();
        if len != record.nbytes {
            return Err(EngineError::Integrity(format!(
                "shard {} is {len} bytes, expected {}",
                record.data_path, record.nbytes
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::TOOL_CALL;
    use crate::testing::{AllowListGrammar, EngineFixture, ScriptPiece};
    use crate::turn::InferRequest;
    use ailoy_types::Message;

    #[test]
    fn prefill_syncs_history_and_kv() {
        let mut fixture = EngineFixture::with_script(&[ScriptPiece::Eos]);
        let tokens: Vec<u32> = (65..80).collect();
        let last = fixture.engine.prefill(&tokens).unwrap();
        assert_eq!(last, 79);
        assert_eq!(fixture.engine.history(), &tokens[..]);
        assert_eq!(
            fixture.engine.kv().total_sequence_length(),
            tokens.len()
        );
    }

    #[test]
    fn decode_grows_history_and_kv_by_one() {
        let mut fixture = EngineFixture::with_script(&[ScriptPiece::Text("x"), ScriptPiece::Eos]);
        let tokens: Vec<u32> = (65..70).collect();
        let last = fixture.engine.prefill(&tokens).unwrap();
        let step = fixture.engine.decode_step(last).unwrap();
        assert_eq!(fixture.engine.history().len(), tokens.len() + 1);
        assert_eq!(
            fixture.engine.kv().total_sequence_length(),
            tokens.len() + 1
        );
        assert_eq!(*fixture.engine.history().last().unwrap(), step.token);
    }

    #[test]
    fn lcp_reuse_pops_then_forwards_only_the_new_suffix() {
        let mut fixture = EngineFixture::with_script(&[ScriptPiece::Eos]);
        let kv_probe = fixture.probe.kv().unwrap();

        // T1 and T2 share a 4-token prefix.
        let t1: Vec<u32> = vec![1, 2, 3, 4, 10, 11];
        let t2: Vec<u32> = vec![1, 2, 3, 4, 20, 21, 22];

        fixture.engine.prefill(&t1).unwrap();
        let forwarded_before = kv_probe.forwarded_tokens();
        assert_eq!(forwarded_before, t1.len());

        fixture.engine.prefill(&t2).unwrap();
        assert_eq!(kv_probe.popn_sizes(), vec![t1.len() - 4]);
        assert_eq!(kv_probe.forwarded_tokens(), t1.len() + (t2.len() - 4));
        assert_eq!(fixture.engine.history(), &t2[..]);
    }

    #[test]
    fn identical_prefill_forwards_nothing() {
        let mut fixture =
            EngineFixture::with_script(&[ScriptPiece::Special("<think>"), ScriptPiece::Eos]);
        let kv_probe = fixture.probe.kv().unwrap();
        let tokens: Vec<u32> = vec![5, 6, 7, 8];

        fixture.engine.prefill(&tokens).unwrap();
        let forwarded = kv_probe.forwarded_tokens();
        let last = fixture.engine.prefill(&tokens).unwrap();

        assert_eq!(last, 8);
        assert_eq!(kv_probe.forwarded_tokens(), forwarded);
        assert!(kv_probe.popn_sizes().is_empty());

        // Enter a non-default mode, then re-prefill the exact history:
        // the no-op path must leave stream-mode state alone.
        let step = fixture.engine.decode_step(last).unwrap();
        assert_eq!(fixture.engine.current_mode(), REASONING);
        let mut full = tokens.clone();
        full.push(step.token);
        fixture.engine.prefill(&full).unwrap();
        assert_eq!(fixture.engine.current_mode(), REASONING);
        assert!(kv_probe.popn_sizes().is_empty());
    }

    #[test]
    fn prefill_chunks_respect_chunk_size() {
        // Fixture prefill_chunk_size is 32.
        let mut fixture = EngineFixture::with_script(&[ScriptPiece::Eos]);
        let tokens: Vec<u32> = (0..70).map(|i| 65 + (i % 20)).collect();
        fixture.engine.prefill(&tokens).unwrap();
        assert_eq!(fixture.probe.prefill_chunks(), vec![32, 32, 6]);
    }

    #[test]
    fn oversized_prompt_hits_context_length_limit() {
        let mut fixture = EngineFixture::tiny_context();
        let tokens: Vec<u32> = (0..100).map(|i| 65 + (i % 20)).collect();
        let err = fixture.engine.prefill(&tokens).unwrap_err();
        assert!(matches!(err, EngineError::ContextLengthLimit));
    }

    #[test]
    fn constrained_sampling_never_picks_a_masked_token() {
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Special("<tool_call>"),
            ScriptPiece::Text("{}"),
            ScriptPiece::Special("</tool_call>"),
            ScriptPiece::Eos,
        ]);
        let tokenizer = fixture.engine.tokenizer();
        let allowed = tokenizer.encode("{}").unwrap();
        fixture
            .engine
            .bind_grammar(TOOL_CALL, std::sync::Arc::new(AllowListGrammar::new(allowed)))
            .unwrap();

        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("call the tool")],
                ..Default::default()
            })
            .unwrap();
        while fixture.engine.step_turn(&mut turn).unwrap().is_some() {}

        let masked = fixture.probe.masked_samples_allowed();
        // Every sample under a matcher was permitted by its bitmask.
        assert!(!masked.is_empty());
        assert!(masked.iter().all(|&ok| ok), "a masked token was sampled");
    }

    #[test]
    fn matcher_is_dropped_after_mode_exit() {
        let mut fixture = EngineFixture::with_script(&[
            ScriptPiece::Special("<tool_call>"),
            ScriptPiece::Text("{}"),
            ScriptPiece::Special("</tool_call>"),
            ScriptPiece::Text("done"),
            ScriptPiece::Eos,
        ]);
        let mut turn = fixture
            .engine
            .begin_turn(&InferRequest {
                messages: vec![Message::user_text("q")],
                ..Default::default()
            })
            .unwrap();
        while fixture.engine.step_turn(&mut turn).unwrap().is_some() {}

        // Masks stop once the tool call closed: the trailing "done" +
        // eos tokens sample unmasked.
        let masks = fixture.probe.masks();
        let decode_steps = fixture.probe.decode_steps();
        assert!(masks.len() < decode_steps);
        assert_eq!(fixture.engine.current_mode(), crate::modes::OUTPUT_TEXT);
    }

    #[test]
    fn sampling_config_roundtrip() {
        let mut fixture = EngineFixture::with_script(&[ScriptPiece::Eos]);
        let shipped = fixture.engine.sampling_config();
        fixture.engine.set_sampling_config(SamplingConfig {
            temperature: 1.3,
            top_p: 0.5,
        });
        assert_eq!(fixture.engine.sampling_config().temperature, 1.3);
        fixture.engine.reset_sampling_config();
        assert_eq!(fixture.engine.sampling_config(), shipped);
    }

    #[test]
    fn shard_size_verification() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shard0.bin"), vec![0u8; 8]).unwrap();
        std::fs::write(
            dir.path().join("ndarray-cache.json"),
            r#"{"records":[{"dataPath":"shard0.bin","nbytes":8}]}"#,
        )
        .unwrap();
        assert!(verify_shard_sizes(dir.path()).is_ok());

        std::fs::write(
            dir.path().join("ndarray-cache.json"),
            r#"{"records":[{"dataPath":"shard0.bin","nbytes":9}]}"#,
        )
        .unwrap();
        assert!(matches!(
            verify_shard_sizes(dir.path()),
            Err(EngineError::Integrity(_))
        ));
    }
}
