//! Admin surface: health probes, version, key management, tenant reload.

use axum::Json;
use axum::extract::{Extension, Path, State};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::auth::{AuthenticatedClient, Permission};
use crate::secret::ExposeSecret;
use crate::server::error::ApiError;
use crate::server::{AppState, require};
use crate::tenant::{RateLimits, ReloadDiff};

/// Liveness probe; no auth.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Readiness probe: the registry must be serving at least one tenant.
pub async fn readyz(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let tenants = state.orchestrator.registry().tenant_ids().len();
    if tenants == 0 {
        return Err(ApiError::Unavailable("no tenants loaded".into()));
    }
    Ok(Json(serde_json::json!({"status": "ready", "tenants": tenants})))
}

pub async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct MintKeyRequest {
    pub client_name: String,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub rate_limits: RateLimits,
}

#[derive(Debug, Serialize)]
pub struct MintKeyResponse {
    pub client_id: String,
    /// Shown exactly once; the gateway stores only the hash.
    pub bearer: String,
    pub permissions: Vec<String>,
}

/// Mint a client key. Admin; dynamic auth mode only.
pub async fn mint_key(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(request): Json<MintKeyRequest>,
) -> Result<Json<MintKeyResponse>, ApiError> {
    require(&client, Permission::Admin)?;
    let store = state.credential_store.as_ref().ok_or_else(|| {
        ApiError::FailedPrecondition("key management requires dynamic auth mode".into())
    })?;

    let mut permissions = Vec::with_capacity(request.permissions.len());
    for name in &request.permissions {
        let permission = Permission::from_str(name)
            .map_err(|_| ApiError::InvalidArgument(format!("unknown permission {name:?}")))?;
        permissions.push(permission);
    }
    if permissions.is_empty() {
        return Err(ApiError::InvalidArgument("at least one permission required".into()));
    }

    let minted = store
        .mint(&request.client_name, permissions.clone(), request.rate_limits)
        .map_err(ApiError::from)?;
    Ok(Json(MintKeyResponse {
        client_id: minted.client_id,
        bearer: minted.bearer.expose_secret().to_string(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct KeyView {
    pub client_id: String,
    pub client_name: String,
    pub permissions: Vec<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked: bool,
}

/// List keys, hashes redacted. Admin.
pub async fn list_keys(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
) -> Result<Json<Vec<KeyView>>, ApiError> {
    require(&client, Permission::Admin)?;
    let store = state.credential_store.as_ref().ok_or_else(|| {
        ApiError::FailedPrecondition("key management requires dynamic auth mode".into())
    })?;

    let keys = store
        .list()
        .into_iter()
        .map(|key| KeyView {
            client_id: key.client_id,
            client_name: key.client_name,
            permissions: key.permissions.iter().map(|p| p.to_string()).collect(),
            created_at: key.created_at.to_rfc3339(),
            last_used_at: key.last_used_at.map(|t| t.to_rfc3339()),
            revoked: key.revoked,
        })
        .collect();
    Ok(Json(keys))
}

/// Revoke a key. Admin.
pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
    Path(client_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require(&client, Permission::Admin)?;
    let store = state.credential_store.as_ref().ok_or_else(|| {
        ApiError::FailedPrecondition("key management requires dynamic auth mode".into())
    })?;

    if !store.revoke(&client_id).map_err(ApiError::from)? {
        return Err(ApiError::NotFound(format!("client {client_id:?} not found")));
    }
    Ok(Json(serde_json::json!({"revoked": client_id})))
}

#[derive(Debug, Serialize)]
pub struct ReloadView {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl From<ReloadDiff> for ReloadView {
    fn from(diff: ReloadDiff) -> Self {
        Self {
            added: diff.added,
            removed: diff.removed,
            unchanged: diff.unchanged,
        }
    }
}

/// Atomically reload tenant configurations. Admin.
pub async fn reload_tenants(
    State(state): State<AppState>,
    Extension(client): Extension<AuthenticatedClient>,
) -> Result<Json<ReloadView>, ApiError> {
    require(&client, Permission::Admin)?;
    let diff = state
        .orchestrator
        .registry()
        .reload()
        .await
        .map_err(ApiError::from)?;
    Ok(Json(diff.into()))
}
