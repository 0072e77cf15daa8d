//! Model configuration files: `mlc-chat-config.json` and
//! `chat-template-config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Sampling parameters, adjustable per engine with a retained default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Softmax temperature; 0 collapses to greedy.
    pub temperature: f32,
    /// Nucleus sampling threshold.
    pub top_p: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
        }
    }
}

fn default_page_size() -> usize {
    16
}

/// The subset of `mlc-chat-config.json` the engine consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Default sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Default nucleus threshold.
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Context window in tokens.
    pub context_window_size: usize,
    /// Sliding window; non-positive disables it.
    #[serde(default)]
    pub sliding_window_size: i64,
    /// Largest chunk forwarded during prefill.
    pub prefill_chunk_size: usize,
    /// KV page size in tokens.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl ModelConfig {
    /// Parse from a `mlc-chat-config.json` file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| EngineError::Artifact(format!("{}: {e}", path.display())))
    }

    /// The sampling defaults this model ships with.
    pub fn sampling(&self) -> SamplingConfig {
        let defaults = SamplingConfig::default();
        SamplingConfig {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
        }
    }

    /// Sliding window size, if enabled.
    pub fn sliding_window(&self) -> Option<usize> {
        (self.sliding_window_size > 0).then_some(self.sliding_window_size as usize)
    }
}

/// `chat-template-config.json`: the template file plus the model's
/// delimiter tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Template file name, relative to the model directory.
    pub template_file: String,
    /// Beginning-of-sequence token text.
    pub bos_token: String,
    /// End-of-sequence token text.
    pub eos_token: String,
    /// Beginning-of-tool-call token text, when the model has one.
    #[serde(default)]
    pub botc_token: Option<String>,
    /// End-of-tool-call token text, when the model has one.
    #[serde(default)]
    pub eotc_token: Option<String>,
}

impl TemplateConfig {
    /// Parse from a `chat-template-config.json` file.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| EngineError::Artifact(format!("{}: {e}", path.display())))
    }
}
