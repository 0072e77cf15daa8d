//! Model descriptors an agent can be bound to.

use ailoy_types::Value;

/// Which model backs an agent.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSpec {
    /// A TVM-compiled model run by the local decode engine.
    Local {
        /// Model id, e.g. `Qwen/Qwen3-0.6B`.
        model_id: String,
        /// Quantization scheme; the engine default applies when `None`.
        quantization: Option<String>,
        /// Target device name; `cpu` when `None`.
        device: Option<String>,
    },
    /// An OpenAI-compatible remote endpoint.
    Remote {
        /// Provider component type: `openai`, `gemini`, `claude`, `grok`.
        provider: String,
        /// Provider-side model name.
        model: String,
        /// API key.
        api_key: String,
        /// Endpoint override.
        base_url: Option<String>,
    },
}

impl ModelSpec {
    /// A local model with defaults.
    pub fn local(model_id: impl Into<String>) -> Self {
        ModelSpec::Local {
            model_id: model_id.into(),
            quantization: None,
            device: None,
        }
    }

    /// A remote model.
    pub fn remote(
        provider: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        ModelSpec::Remote {
            provider: provider.into(),
            model: model.into(),
            api_key: api_key.into(),
            base_url: None,
        }
    }

    /// The VM component type this spec instantiates.
    pub fn component_type(&self) -> &str {
        match self {
            ModelSpec::Local { .. } => "tvm_language_model",
            ModelSpec::Remote { provider, .. } => provider,
        }
    }

    /// The `define` attributes for this spec.
    pub fn attrs(&self) -> Value {
        match self {
            ModelSpec::Local {
                model_id,
                quantization,
                device,
            } => {
                let mut attrs = Value::map([("model", Value::from(model_id.as_str()))]);
                if let (Value::Map(entries), Some(quantization)) = (&mut attrs, quantization) {
                    entries.insert("quantization".into(), Value::from(quantization.as_str()));
                }
                if let (Value::Map(entries), Some(device)) = (&mut attrs, device) {
                    entries.insert("device".into(), Value::from(device.as_str()));
                }
                attrs
            }
            ModelSpec::Remote {
                model,
                api_key,
                base_url,
                ..
            } => {
                let mut attrs = Value::map([
                    ("model", Value::from(model.as_str())),
                    ("api_key", Value::from(api_key.as_str())),
                ]);
                if let (Value::Map(entries), Some(base_url)) = (&mut attrs, base_url) {
                    entries.insert("base_url".into(), Value::from(base_url.as_str()));
                }
                attrs
            }
        }
    }

    /// The default system message when the host supplies none.
    pub fn default_system_message(&self) -> String {
        let name = match self {
            ModelSpec::Local { model_id, .. } => model_id.as_str(),
            ModelSpec::Remote { model, .. } => model.as_str(),
        };
        format!(
            "You are {name}, a helpful assistant. Answer concisely and use the \
             available tools when they help."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_spec_attrs() {
        let spec = ModelSpec::Local {
            model_id: "Qwen/Qwen3-0.6B".into(),
            quantization: Some("q4f16_1".into()),
            device: None,
        };
        assert_eq!(spec.component_type(), "tvm_language_model");
        let attrs = spec.attrs();
        assert_eq!(attrs.get("model").unwrap().as_str(), Some("Qwen/Qwen3-0.6B"));
        assert_eq!(attrs.get("quantization").unwrap().as_str(), Some("q4f16_1"));
        assert!(attrs.get("device").is_none());
    }

    #[test]
    fn remote_spec_routes_to_provider_type() {
        let spec = ModelSpec::remote("claude", "claude-sonnet-4", "sk-key");
        assert_eq!(spec.component_type(), "claude");
        assert_eq!(spec.attrs().get("api_key").unwrap().as_str(), Some("sk-key"));
    }
}
