//! Vector stores with cosine-similarity retrieval.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ailoy_types::Value;

use crate::EmbedError;

/// One stored vector with its document and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Store-assigned identifier.
    pub id: String,
    /// The embedding.
    pub embedding: Vec<f32>,
    /// The document text the embedding was computed from.
    pub document: String,
    /// Caller-supplied metadata.
    pub metadata: Value,
}

/// A retrieval hit: record plus similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedRecord {
    /// The matching record.
    #[serde(flatten)]
    pub record: VectorRecord,
    /// Cosine similarity to the query embedding.
    pub similarity: f32,
}

/// Cosine similarity of two vectors. Zero when either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// A collection of embedded documents searchable by similarity.
#[async_trait]
pub trait VectorStore: Send {
    /// Insert a document, returning its id.
    async fn insert(
        &mut self,
        embedding: Vec<f32>,
        document: String,
        metadata: Value,
    ) -> Result<String, EmbedError>;

    /// Fetch a record by id.
    async fn get_by_id(&mut self, id: &str) -> Result<Option<VectorRecord>, EmbedError>;

    /// The `top_k` most similar records, most similar first.
    async fn retrieve(
        &mut self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedRecord>, EmbedError>;

    /// Remove a record.
    async fn remove(&mut self, id: &str) -> Result<(), EmbedError>;

    /// Remove every record.
    async fn clear(&mut self) -> Result<(), EmbedError>;
}

/// In-memory cosine index: the local store for embedded deployments.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    records: IndexMap<String, VectorRecord>,
    dimension: Option<usize>,
}

impl InMemoryVectorStore {
    /// An empty store; the first insert fixes the dimension.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store with a fixed dimension.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            records: IndexMap::new(),
            dimension: Some(dimension),
        }
    }

    fn check_dimension(&mut self, len: usize) -> Result<(), EmbedError> {
        match self.dimension {
            Some(expected) if expected != len => Err(EmbedError::Dimension {
                expected,
                actual: len,
            }),
            Some(_) => Ok(()),
            None => {
                self.dimension = Some(len);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(
        &mut self,
        embedding: Vec<f32>,
        document: String,
        metadata: Value,
    ) -> Result<String, EmbedError> {
        self.check_dimension(embedding.len())?;
        let id = Uuid::new_v4().to_string();
        self.records.insert(
            id.clone(),
            VectorRecord {
                id: id.clone(),
                embedding,
                document,
                metadata,
            },
        );
        Ok(id)
    }

    async fn get_by_id(&mut self, id: &str) -> Result<Option<VectorRecord>, EmbedError> {
        Ok(self.records.get(id).cloned())
    }

    async fn retrieve(
        &mut self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedRecord>, EmbedError> {
        let mut hits: Vec<RetrievedRecord> = self
            .records
            .values()
            .map(|record| RetrievedRecord {
                similarity: cosine_similarity(&record.embedding, query_embedding),
                record: record.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn remove(&mut self, id: &str) -> Result<(), EmbedError> {
        self.records
            .shift_remove(id)
            .map(|_| ())
            .ok_or_else(|| EmbedError::NotFound(id.to_owned()))
    }

    async fn clear(&mut self) -> Result<(), EmbedError> {
        self.records.clear();
        Ok(())
    }
}

/// A vector collection behind a REST API.
///
/// Endpoint shapes: `POST {base}/collections/{name}/records` to insert,
/// `GET .../records/{id}`, `POST .../query` with `{embedding, top_k}`,
/// `DELETE .../records/{id}`, `DELETE .../records`.
pub struct HttpVectorStore {
    base_url: String,
    collection: String,
    client: reqwest::Client,
}

impl HttpVectorStore {
    /// Connect to `collection` at `base_url`.
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            collection: collection.into(),
            client: reqwest::Client::new(),
        }
    }

    fn records_url(&self) -> String {
        format!(
            "{}/collections/{}/records",
            self.base_url.trim_end_matches('/'),
            self.collection
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, EmbedError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(EmbedError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn insert(
        &mut self,
        embedding: Vec<f32>,
        document: String,
        metadata: Value,
    ) -> Result<String, EmbedError> {
        let response = self
            .client
            .post(self.records_url())
            .json(&serde_json::json!({
                "embedding": embedding,
                "document": document,
                "metadata": serde_json::Value::from(&metadata),
            }))
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        let body: serde_json::Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| EmbedError::InvalidResponse("insert response has no id".into()))
    }

    async fn get_by_id(&mut self, id: &str) -> Result<Option<VectorRecord>, EmbedError> {
        let response = self
            .client
            .get(format!("{}/{id}", self.records_url()))
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map(Some)
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))
    }

    async fn retrieve(
        &mut self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedRecord>, EmbedError> {
        let response = self
            .client
            .post(format!("{}/query", self.records_url()))
            .json(&serde_json::json!({
                "embedding": query_embedding,
                "top_k": top_k,
            }))
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        let body: serde_json::Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| EmbedError::InvalidResponse(e.to_string()))?;
        serde_json::from_value(
            body.get("results")
                .cloned()
                .unwrap_or(serde_json::Value::Array(Vec::new())),
        )
        .map_err(|e| EmbedError::InvalidResponse(e.to_string()))
    }

    async fn remove(&mut self, id: &str) -> Result<(), EmbedError> {
        let response = self
            .client
            .delete(format!("{}/{id}", self.records_url()))
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        Self::check(response).await.map(|_| ())
    }

    async fn clear(&mut self) -> Result<(), EmbedError> {
        let response = self
            .client
            .delete(self.records_url())
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        Self::check(response).await.map(|_| ())
    }
}
