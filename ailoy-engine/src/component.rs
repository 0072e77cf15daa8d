//! VM integration: the `tvm_language_model` component.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use ailoy_cache::{DownloadOptions, ModelCache, TargetDevice};
use ailoy_types::{ComponentError, Value};
use ailoy_vm::{Component, MethodStream, ModuleRegistry};

use crate::config::SamplingConfig;
use crate::engine::{BackendLoader, LocalEngine};
use crate::error::EngineError;
use crate::turn::InferRequest;

/// Component type name served by [`language_model_module`].
pub const LANGUAGE_MODEL_TYPE: &str = "tvm_language_model";

/// A local language model hosted as a VM component.
///
/// `infer` is iterative: one [`MessageOutput`](ailoy_types::MessageOutput)
/// frame per partial packet. Grammar management is exposed as instant
/// methods.
pub struct LanguageModelComponent {
    engine: Arc<Mutex<LocalEngine>>,
}

impl LanguageModelComponent {
    /// Wrap an engine.
    pub fn new(engine: LocalEngine) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }
}

#[async_trait]
impl Component for LanguageModelComponent {
    async fn call_method(&mut self, method: &str, inputs: Value) -> Result<Value, ComponentError> {
        let mut engine = self.engine.lock().await;
        match method {
            "set_grammar" => {
                let mode = required_str(&inputs, "mode")?;
                let kind = required_str(&inputs, "kind")?;
                let value = inputs.get("value").and_then(Value::as_str).unwrap_or("");
                let result = match kind {
                    "builtin" => engine.set_builtin_grammar(mode, value),
                    "json_schema" => engine.set_json_schema_grammar(mode, value),
                    "regex" => engine.set_regex_grammar(mode, value),
                    "ebnf" => engine.set_ebnf_grammar(mode, value),
                    other => Err(EngineError::InvalidInput(format!(
                        "unknown grammar kind {other}"
                    ))),
                };
                result.map_err(ComponentError::from)?;
                Ok(Value::Null)
            }
            "reset_grammar" => {
                let mode = required_str(&inputs, "mode")?;
                engine.reset_grammar(mode).map_err(ComponentError::from)?;
                Ok(Value::Null)
            }
            "get_sampling_config" => {
                let config = engine.sampling_config();
                Ok(Value::map([
                    ("temperature", Value::Double(config.temperature as f64)),
                    ("top_p", Value::Double(config.top_p as f64)),
                ]))
            }
            "set_sampling_config" => {
                let current = engine.sampling_config();
                engine.set_sampling_config(SamplingConfig {
                    temperature: inputs
                        .get("temperature")
                        .and_then(Value::as_f64)
                        .map(|v| v as f32)
                        .unwrap_or(current.temperature),
                    top_p: inputs
                        .get("top_p")
                        .and_then(Value::as_f64)
                        .map(|v| v as f32)
                        .unwrap_or(current.top_p),
                });
                Ok(Value::Null)
            }
            "reset_sampling_config" => {
                engine.reset_sampling_config();
                Ok(Value::Null)
            }
            other => Err(ComponentError::not_found(format!("no method {other}"))),
        }
    }

    fn iter_method(&mut self, method: &str, inputs: Value) -> Result<MethodStream, ComponentError> {
        if method != "infer" {
            return Err(ComponentError::not_found(format!(
                "no iterative method {method}"
            )));
        }
        let request: InferRequest =
            serde_json::from_value(serde_json::Value::from(&inputs))
                .map_err(|e| ComponentError::validation(format!("invalid infer inputs: {e}")))?;

        let engine = Arc::clone(&self.engine);
        Ok(Box::pin(async_stream::stream! {
            let mut engine = engine.lock().await;
            let mut turn = match engine.begin_turn(&request) {
                Ok(turn) => turn,
                Err(e) => {
                    yield Err(ComponentError::from(e));
                    return;
                }
            };
            loop {
                match engine.step_turn(&mut turn) {
                    Ok(Some(frame)) => {
                        let body = serde_json::to_value(&frame)
                            .map(Value::from)
                            .unwrap_or(Value::Null);
                        yield Ok(body);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(ComponentError::from(e));
                        break;
                    }
                }
                // Decode steps are CPU-heavy; give the worker a chance to
                // observe cancellation between frames.
                tokio::task::yield_now().await;
            }
        }))
    }
}

fn required_str<'a>(inputs: &'a Value, key: &str) -> Result<&'a str, ComponentError> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ComponentError::validation(format!("missing {key}")))
}

/// Module serving `tvm_language_model` components.
///
/// `attrs`: `{model, quantization?, device?, skip_integrity_check?}`.
/// Construction resolves weights through the cache, then binds the
/// compiled library via `loader`.
pub fn language_model_module(
    cache: ModelCache,
    loader: Arc<dyn BackendLoader>,
) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register_component(LANGUAGE_MODEL_TYPE, move |attrs| {
            let cache = cache.clone();
            let loader = Arc::clone(&loader);
            async move {
                let model = attrs
                    .get("model")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("attrs require a model id"))?
                    .to_owned();
                let quantization = attrs
                    .get("quantization")
                    .and_then(Value::as_str)
                    .unwrap_or("q4f16_1")
                    .to_owned();
                let device = match attrs.get("device").and_then(Value::as_str).unwrap_or("cpu") {
                    "cpu" => TargetDevice::Cpu,
                    "metal" => TargetDevice::Metal,
                    "vulkan" => TargetDevice::Vulkan,
                    "cuda" => TargetDevice::Cuda,
                    other => {
                        return Err(ComponentError::validation(format!(
                            "unknown device {other}"
                        )));
                    }
                };
                let options = DownloadOptions {
                    skip_integrity_check: attrs
                        .get("skip_integrity_check")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    ..Default::default()
                };

                debug!(model, quantization, "resolving local model");
                let artifacts = cache
                    .download_model(&model, &quantization, device, &options)
                    .await
                    .map_err(ComponentError::from)?;

                let engine = tokio::task::spawn_blocking(move || {
                    LocalEngine::load(&artifacts, loader.as_ref())
                })
                .await
                .map_err(|e| ComponentError::internal(format!("loader task failed: {e}")))?
                .map_err(ComponentError::from)?;

                Ok(Box::new(LanguageModelComponent::new(engine)) as Box<dyn Component>)
            }
        })
        .expect("fresh registry");
    registry
}
