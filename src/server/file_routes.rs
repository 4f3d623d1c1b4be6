//! File-store RPC handlers: vector store lifecycle and document ingest.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, Query, State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{AuthenticatedClient, Permission};
use crate::rag::RagService;
use crate::server::error::ApiError;
use crate::server::{AppState, require};
use crate::tenant::TenantConfig;

fn rag(state: &AppState) -> Result<&Arc<RagService>, ApiError> {
    state.rag.as_ref().ok_or_else(|| {
        ApiError::FailedPrecondition("retrieval pipeline is not enabled".into())
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateStoreRequest {
    pub store_id: String,
}

#[derive(Debug, Serialize)]
pub struct StoreView {
    pub store_id: String,
    pub points: u64,
}

pub async fn create_store(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(request): Json<CreateStoreRequest>,
) -> Result<Json<StoreView>, ApiError> {
    require(&client, Permission::File)?;
    let rag = rag(&state)?;
    rag.create_store(&tenant.tenant_id, &request.store_id).await?;
    Ok(Json(StoreView {
        store_id: request.store_id,
        points: 0,
    }))
}

pub async fn delete_store(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Path(store_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require(&client, Permission::File)?;
    let rag = rag(&state)?;
    rag.delete_store(&tenant.tenant_id, &store_id).await?;
    Ok(Json(serde_json::json!({"deleted": store_id})))
}

pub async fn get_store(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Path(store_id): Path<String>,
) -> Result<Json<StoreView>, ApiError> {
    require(&client, Permission::File)?;
    let rag = rag(&state)?;
    let info = rag.store_info(&tenant.tenant_id, &store_id).await?;
    Ok(Json(StoreView {
        store_id: info.store_id,
        points: info.points,
    }))
}

pub async fn list_stores(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
) -> Result<Json<Vec<String>>, ApiError> {
    require(&client, Permission::File)?;
    let rag = rag(&state)?;
    Ok(Json(rag.list_stores(&tenant.tenant_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub store_id: String,
    pub filename: String,
    pub chunks_indexed: usize,
}

/// Ingest one document: extract → chunk → embed → index.
pub async fn upload(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Path(store_id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    require(&client, Permission::File)?;
    if body.is_empty() {
        return Err(ApiError::InvalidArgument("empty upload body".into()));
    }
    let rag = rag(&state)?;
    let chunks_indexed = rag
        .ingest(&tenant.tenant_id, &store_id, &query.filename, &body)
        .await?;
    Ok(Json(UploadResponse {
        store_id,
        filename: query.filename,
        chunks_indexed,
    }))
}
