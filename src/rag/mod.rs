//! Retrieval pipeline: extract → chunk → embed → index, and top-K
//! retrieval at chat time.
//!
//! Every public operation is tenant-scoped. Tenant and store ids are
//! validated before they ever reach a physical collection name, which is
//! always `{tenant_id}_{store_id}`.

mod chunker;
mod embedder;
mod extractor;
mod vector;

pub use chunker::{Chunk, ChunkerConfig, chunk_text};
pub use embedder::{Embedder, HttpEmbedder};
pub use extractor::{HttpExtractor, TextExtractor};
pub use vector::{CollectionStats, IndexPoint, QdrantIndex, ScoredText, VectorIndex};

use regex::Regex;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::RagConfig;

const MAX_ID_LENGTH: usize = 128;

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("static pattern"))
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid identifier {0:?}")]
    InvalidId(String),
    #[error("store {0:?} not found")]
    StoreNotFound(String),
    #[error("extractor failed: {0}")]
    Extractor(String),
    #[error("embedder failed: {0}")]
    Embedder(String),
    #[error("vector index failed: {0}")]
    Index(String),
}

/// One retrieval result surfaced to the orchestrator.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub score: f32,
    pub source: String,
}

/// Store size report for the files surface.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub store_id: String,
    pub points: u64,
}

pub struct RagService {
    extractor: Arc<dyn TextExtractor>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    chunker: ChunkerConfig,
    top_k_default: usize,
}

impl RagService {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        config: &RagConfig,
    ) -> Self {
        Self {
            extractor,
            embedder,
            index,
            chunker: ChunkerConfig {
                max_chunk_size: config.max_chunk_size,
                min_chunk_size: config.min_chunk_size,
                overlap: config.overlap,
            },
            top_k_default: config.top_k,
        }
    }

    /// From external configuration: HTTP extractor/embedder plus qdrant.
    pub fn from_config(config: &RagConfig) -> Result<Self, RagError> {
        Ok(Self::new(
            Arc::new(HttpExtractor::new(&config.extractor_url)),
            Arc::new(HttpEmbedder::new(&config.embedder_url, config.embedding_dim)),
            Arc::new(QdrantIndex::connect(&config.qdrant_url)?),
            config,
        ))
    }

    pub async fn create_store(&self, tenant_id: &str, store_id: &str) -> Result<(), RagError> {
        let collection = collection_name(tenant_id, store_id)?;
        self.index
            .create_collection(&collection, self.embedder.dimensions())
            .await?;
        info!(tenant = tenant_id, store = store_id, "created vector store");
        Ok(())
    }

    pub async fn delete_store(&self, tenant_id: &str, store_id: &str) -> Result<(), RagError> {
        let collection = collection_name(tenant_id, store_id)?;
        if !self.index.collection_exists(&collection).await? {
            return Err(RagError::StoreNotFound(store_id.to_string()));
        }
        self.index.delete_collection(&collection).await?;
        info!(tenant = tenant_id, store = store_id, "deleted vector store");
        Ok(())
    }

    pub async fn store_info(&self, tenant_id: &str, store_id: &str) -> Result<StoreInfo, RagError> {
        let collection = collection_name(tenant_id, store_id)?;
        if !self.index.collection_exists(&collection).await? {
            return Err(RagError::StoreNotFound(store_id.to_string()));
        }
        let stats = self.index.collection_stats(&collection).await?;
        Ok(StoreInfo {
            store_id: store_id.to_string(),
            points: stats.points,
        })
    }

    /// Stores of one tenant, by stripping the tenant prefix off collection
    /// names.
    pub async fn list_stores(&self, tenant_id: &str) -> Result<Vec<String>, RagError> {
        validate_id(tenant_id)?;
        let prefix = format!("{tenant_id}_");
        let mut stores: Vec<String> = self
            .index
            .list_collections()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .collect();
        stores.sort_unstable();
        Ok(stores)
    }

    /// Ingest one document: extract text, chunk, embed, upsert.
    /// Returns the number of chunks indexed.
    pub async fn ingest(
        &self,
        tenant_id: &str,
        store_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<usize, RagError> {
        let collection = collection_name(tenant_id, store_id)?;
        if !self.index.collection_exists(&collection).await? {
            return Err(RagError::StoreNotFound(store_id.to_string()));
        }

        let text = self.extractor.extract(filename, bytes).await?;
        let chunks = chunk_text(&text, &self.chunker);
        if chunks.is_empty() {
            return Ok(0);
        }

        let inputs: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&inputs).await?;

        let points: Vec<IndexPoint> = chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (chunk, vector))| IndexPoint {
                id: Uuid::new_v4().to_string(),
                vector,
                text: chunk.text,
                source: filename.to_string(),
                chunk_index: i,
            })
            .collect();
        let indexed = points.len();

        self.index.upsert(&collection, points).await?;
        info!(
            tenant = tenant_id,
            store = store_id,
            file = filename,
            chunks = indexed,
            "ingested document"
        );
        Ok(indexed)
    }

    /// Embed the query and fetch the top-K chunks.
    pub async fn retrieve(
        &self,
        tenant_id: &str,
        store_id: &str,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<RetrievedChunk>, RagError> {
        let collection = collection_name(tenant_id, store_id)?;
        let k = top_k.unwrap_or(self.top_k_default).max(1);

        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| RagError::Embedder("no query vector produced".into()))?;

        let hits = self.index.search(&collection, vector, k).await?;
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                text: hit.text,
                score: hit.score,
                source: hit.source,
            })
            .collect())
    }
}

fn validate_id(id: &str) -> Result<(), RagError> {
    if id.len() > MAX_ID_LENGTH || !id_pattern().is_match(id) {
        return Err(RagError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn collection_name(tenant_id: &str, store_id: &str) -> Result<String, RagError> {
    validate_id(tenant_id)?;
    validate_id(store_id)?;
    Ok(format!("{tenant_id}_{store_id}"))
}
