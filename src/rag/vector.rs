//! Vector index backend.
//!
//! The production implementation targets qdrant with cosine distance, one
//! collection per `(tenant, store)` pair. The trait keeps the pipeline
//! testable without a running qdrant.

use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;

use crate::rag::RagError;

/// One chunk ready for indexing.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub source: String,
    pub chunk_index: usize,
}

/// One retrieval hit.
#[derive(Debug, Clone)]
pub struct ScoredText {
    pub text: String,
    pub score: f32,
    pub source: String,
}

/// Collection size report.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    pub points: u64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn create_collection(&self, name: &str, dimensions: u64) -> Result<(), RagError>;
    async fn delete_collection(&self, name: &str) -> Result<(), RagError>;
    async fn collection_exists(&self, name: &str) -> Result<bool, RagError>;
    async fn collection_stats(&self, name: &str) -> Result<CollectionStats, RagError>;
    async fn list_collections(&self) -> Result<Vec<String>, RagError>;
    async fn upsert(&self, name: &str, points: Vec<IndexPoint>) -> Result<(), RagError>;
    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredText>, RagError>;
}

pub struct QdrantIndex {
    client: Qdrant,
}

impl QdrantIndex {
    pub fn connect(url: &str) -> Result<Self, RagError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| RagError::Index(e.to_string()))?;
        Ok(Self { client })
    }
}

fn index_err(e: impl std::fmt::Display) -> RagError {
    RagError::Index(e.to_string())
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn create_collection(&self, name: &str, dimensions: u64) -> Result<(), RagError> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(dimensions, Distance::Cosine)),
            )
            .await
            .map_err(index_err)?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), RagError> {
        self.client.delete_collection(name).await.map_err(index_err)?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, RagError> {
        self.client.collection_exists(name).await.map_err(index_err)
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats, RagError> {
        let info = self.client.collection_info(name).await.map_err(index_err)?;
        let points = info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or_default();
        Ok(CollectionStats { points })
    }

    async fn list_collections(&self) -> Result<Vec<String>, RagError> {
        let response = self.client.list_collections().await.map_err(index_err)?;
        Ok(response
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn upsert(&self, name: &str, points: Vec<IndexPoint>) -> Result<(), RagError> {
        let points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload = Payload::try_from(json!({
                    "text": point.text,
                    "source": point.source,
                    "chunk_index": point.chunk_index as i64,
                }))
                .map_err(index_err)?;
                Ok(PointStruct::new(point.id, point.vector, payload))
            })
            .collect::<Result<_, RagError>>()?;

        self.client
            .upsert_points(UpsertPointsBuilder::new(name, points).wait(true))
            .await
            .map_err(index_err)?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredText>, RagError> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(name, vector, limit as u64).with_payload(true),
            )
            .await
            .map_err(index_err)?;

        Ok(response
            .result
            .into_iter()
            .map(|point| {
                let text = string_field(&point.payload, "text");
                let source = string_field(&point.payload, "source");
                ScoredText {
                    text,
                    score: point.score,
                    source,
                }
            })
            .collect())
    }
}

fn string_field(
    payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
    key: &str,
) -> String {
    payload
        .get(key)
        .and_then(|v| match &v.kind {
            Some(Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}
