//! VM integration: embedding models and vector stores as components.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use ailoy_cache::{DownloadOptions, ModelCache, TargetDevice};
use ailoy_types::{ComponentError, Value};
use ailoy_vm::{Component, ModuleRegistry};

use crate::store::{HttpVectorStore, InMemoryVectorStore, VectorStore};
use crate::{EmbeddingLoader, EmbeddingModel};

/// Component type name for the local embedding model.
pub const EMBEDDING_MODEL_TYPE: &str = "tvm_embedding_model";

/// An embedding model hosted as a VM component.
pub struct EmbeddingModelComponent {
    model: EmbeddingModel,
}

impl EmbeddingModelComponent {
    /// Wrap a model.
    pub fn new(model: EmbeddingModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Component for EmbeddingModelComponent {
    async fn call_method(&mut self, method: &str, inputs: Value) -> Result<Value, ComponentError> {
        match method {
            "infer" => {
                let text = inputs
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("infer requires text"))?;
                let vector = self.model.infer(text).map_err(ComponentError::from)?;
                Ok(Value::map([(
                    "embedding",
                    Value::Array(vector.into_iter().map(|v| Value::Double(v as f64)).collect()),
                )]))
            }
            other => Err(ComponentError::not_found(format!("no method {other}"))),
        }
    }
}

/// A vector store hosted as a VM component.
pub struct VectorStoreComponent {
    store: Box<dyn VectorStore>,
}

impl VectorStoreComponent {
    /// Wrap a store.
    pub fn new(store: Box<dyn VectorStore>) -> Self {
        Self { store }
    }
}

fn parse_embedding(inputs: &Value, key: &str) -> Result<Vec<f32>, ComponentError> {
    inputs
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
        })
        .flatten()
        .ok_or_else(|| ComponentError::validation(format!("{key} must be an array of numbers")))
}

#[async_trait]
impl Component for VectorStoreComponent {
    async fn call_method(&mut self, method: &str, inputs: Value) -> Result<Value, ComponentError> {
        match method {
            "insert" => {
                let embedding = parse_embedding(&inputs, "embedding")?;
                let document = inputs
                    .get("document")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let metadata = inputs.get("metadata").cloned().unwrap_or(Value::Null);
                let id = self
                    .store
                    .insert(embedding, document, metadata)
                    .await
                    .map_err(ComponentError::from)?;
                Ok(Value::map([("id", Value::Str(id))]))
            }
            "get_by_id" => {
                let id = inputs
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("get_by_id requires an id"))?;
                let record = self.store.get_by_id(id).await.map_err(ComponentError::from)?;
                Ok(record
                    .map(|r| {
                        serde_json::to_value(&r)
                            .map(Value::from)
                            .unwrap_or(Value::Null)
                    })
                    .unwrap_or(Value::Null))
            }
            "retrieve" => {
                let embedding = parse_embedding(&inputs, "query_embedding")?;
                let top_k = inputs
                    .get("top_k")
                    .and_then(Value::as_u64)
                    .unwrap_or(5) as usize;
                let hits = self
                    .store
                    .retrieve(&embedding, top_k)
                    .await
                    .map_err(ComponentError::from)?;
                Ok(Value::map([(
                    "results",
                    serde_json::to_value(&hits)
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                )]))
            }
            "remove" => {
                let id = inputs
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ComponentError::validation("remove requires an id"))?;
                self.store.remove(id).await.map_err(ComponentError::from)?;
                Ok(Value::Null)
            }
            "clear" => {
                self.store.clear().await.map_err(ComponentError::from)?;
                Ok(Value::Null)
            }
            other => Err(ComponentError::not_found(format!("no method {other}"))),
        }
    }
}

/// Module serving the vector store component types.
pub fn vector_store_module() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register_component("memory_vector_store", |attrs| async move {
            let store = match attrs.get("dimension").and_then(Value::as_u64) {
                Some(dimension) => InMemoryVectorStore::with_dimension(dimension as usize),
                None => InMemoryVectorStore::new(),
            };
            Ok(Box::new(VectorStoreComponent::new(Box::new(store))) as Box<dyn Component>)
        })
        .expect("fresh registry");
    registry
        .register_component("http_vector_store", |attrs| async move {
            let url = attrs
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| ComponentError::validation("attrs require a url"))?;
            let collection = attrs
                .get("collection")
                .and_then(Value::as_str)
                .unwrap_or("default");
            let store = HttpVectorStore::new(url, collection);
            Ok(Box::new(VectorStoreComponent::new(Box::new(store))) as Box<dyn Component>)
        })
        .expect("fresh registry");
    registry
}

/// Module serving `tvm_embedding_model` components.
///
/// `attrs`: `{model, quantization?, device?}`, resolved through the cache
/// like the language model.
pub fn embedding_model_module(
    cache: ModelCache,
    loader: Arc<dyn EmbeddingLoader>,
) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register_component(EMBEDDING_MODEL_TYPE, move |attrs| {
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
                debug!(model, "resolving embedding model");
                let artifacts = cache
                    .download_model(
                        &model,
                        &quantization,
                        TargetDevice::Cpu,
                        &DownloadOptions::default(),
                    )
                    .await
                    .map_err(ComponentError::from)?;
                let (backend, tokenizer) =
                    loader.load(&artifacts).map_err(ComponentError::from)?;
                Ok(Box::new(EmbeddingModelComponent::new(EmbeddingModel::new(
                    backend, tokenizer,
                ))) as Box<dyn Component>)
            }
        })
        .expect("fresh registry");
    registry
}
