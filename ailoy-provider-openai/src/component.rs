//! VM integration: remote models as components.

use async_trait::async_trait;

use ailoy_types::{ComponentError, Message, ToolDesc, Value};
use ailoy_vm::{Component, MethodStream, ModuleRegistry};

use crate::{ApiProvider, RemoteEngine};

/// A remote model hosted as a VM component.
///
/// `infer` produces a single frame: remote engines answer with one
/// terminal [`MessageOutput`](ailoy_types::MessageOutput).
pub struct RemoteEngineComponent {
    engine: std::sync::Arc<RemoteEngine>,
}

impl RemoteEngineComponent {
    /// Wrap an engine.
    pub fn new(engine: RemoteEngine) -> Self {
        Self {
            engine: std::sync::Arc::new(engine),
        }
    }
}

#[async_trait]
impl Component for RemoteEngineComponent {
    async fn call_method(&mut self, method: &str, _inputs: Value) -> Result<Value, ComponentError> {
        Err(ComponentError::not_found(format!("no method {method}")))
    }

    fn iter_method(&mut self, method: &str, inputs: Value) -> Result<MethodStream, ComponentError> {
        if method != "infer" {
            return Err(ComponentError::not_found(format!(
                "no iterative method {method}"
            )));
        }

        let messages: Vec<Message> = inputs
            .get("messages")
            .map(|v| serde_json::from_value(serde_json::Value::from(v)))
            .transpose()
            .map_err(|e| ComponentError::validation(format!("invalid messages: {e}")))?
            .unwrap_or_default();
        let tools: Vec<ToolDesc> = inputs
            .get("tools")
            .map(|v| serde_json::from_value(serde_json::Value::from(v)))
            .transpose()
            .map_err(|e| ComponentError::validation(format!("invalid tools: {e}")))?
            .unwrap_or_default();

        let engine = std::sync::Arc::clone(&self.engine);
        Ok(Box::pin(async_stream::stream! {
            match engine.infer(&messages, &tools).await {
                Ok(output) => {
                    let body = serde_json::to_value(&output)
                        .map(Value::from)
                        .unwrap_or(Value::Null);
                    yield Ok(body);
                }
                Err(e) => yield Err(ComponentError::from(e)),
            }
        }))
    }
}

/// Module serving the remote provider component types.
///
/// `attrs`: `{model, api_key, base_url?}`.
pub fn remote_model_module() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for provider in [
        ApiProvider::OpenAi,
        ApiProvider::Gemini,
        ApiProvider::Claude,
        ApiProvider::Grok,
    ] {
        registry
            .register_component(provider.type_name(), move |attrs| async move {
                let model = attrs
                    .get("model")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("attrs require a model"))?;
                let api_key = attrs
                    .get("api_key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("attrs require an api_key"))?;
                let mut engine = RemoteEngine::new(provider, model, api_key);
                if let Some(base_url) = attrs.get("base_url").and_then(Value::as_str) {
                    engine = engine.with_base_url(base_url);
                }
                Ok(Box::new(RemoteEngineComponent::new(engine)) as Box<dyn Component>)
            })
            .expect("fresh registry");
    }
    registry
}
