//! Embedding generation via the external embedder service.

use async_trait::async_trait;
use serde_json::json;

use crate::rag::RagError;

/// Produces dense vectors for chunks and queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
    fn dimensions(&self) -> u64;
}

/// OpenAI-shaped HTTP embedder (`POST /embeddings`).
pub struct HttpEmbedder {
    base_url: String,
    dimensions: u64,
    http: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, dimensions: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            dimensions,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"input": texts}))
            .send()
            .await
            .map_err(|e| RagError::Embedder(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::Embedder(format!("embedder returned {status}")));
        }
        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::Embedder(e.to_string()))?;

        let vectors: Vec<Vec<f32>> = parsed["data"]
            .as_array()
            .ok_or_else(|| RagError::Embedder("embedder response missing data".into()))?
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64())
                            .map(|v| v as f32)
                            .collect()
                    })
                    .ok_or_else(|| RagError::Embedder("embedding entry malformed".into()))
            })
            .collect::<Result<_, _>>()?;

        if vectors.len() != texts.len() {
            return Err(RagError::Embedder(format!(
                "embedder returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> u64 {
        self.dimensions
    }
}
