//! Chat RPC handlers.

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthenticatedClient, Permission};
use crate::chat::{ChatRequest, ChatResponse, ProviderSelection};
use crate::providers::CallContext;
use crate::server::error::ApiError;
use crate::server::{AppState, require};
use crate::store::{MessageRow, ThreadRow};
use crate::tenant::TenantConfig;

/// `Chat.Generate`: one unary turn.
pub async fn generate(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    require(&client, Permission::Chat)?;

    // Dropping the handler (client disconnect) cancels the provider call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let ctx = CallContext::new(cancel, None, false);

    let response = state
        .orchestrator
        .generate(&tenant, &client, request, ctx)
        .await?;
    Ok(Json(response))
}

/// `Chat.GenerateStream`: SSE stream of chunks, exactly one terminal
/// `complete` or `error` event.
pub async fn generate_stream(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    require(&client, Permission::Chat)?;
    require(&client, Permission::ChatStream)?;

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let ctx = CallContext::new(cancel, None, false);

    let rx = state
        .orchestrator
        .generate_stream(&tenant, &client, request, ctx)
        .await?;

    // The guard lives inside the stream: when the client disconnects and
    // the SSE body drops, cancellation reaches the emitter.
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        let _held = &guard;
        let data = serde_json::to_string(&chunk).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SelectProviderRequest {
    pub provider: Option<String>,
}

/// `Chat.SelectProvider`: advisory, which provider a turn would use.
pub async fn select_provider(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Json(request): Json<SelectProviderRequest>,
) -> Result<Json<ProviderSelection>, ApiError> {
    require(&client, Permission::Chat)?;
    let selection = state
        .orchestrator
        .select_provider(&tenant, request.provider.as_deref())?;
    Ok(Json(selection))
}

/// Operator/debug read: a tenant's threads. Admin only.
pub async fn list_threads(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
) -> Result<Json<Vec<ThreadRowView>>, ApiError> {
    require(&client, Permission::Admin)?;
    state.store.ensure_tenant(&tenant.tenant_id).await?;
    let threads = state.store.list_threads(&tenant.tenant_id).await?;
    Ok(Json(threads.into_iter().map(Into::into).collect()))
}

/// Operator/debug read: one thread's messages. Admin only.
pub async fn thread_messages(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<TenantConfig>>,
    Extension(client): Extension<AuthenticatedClient>,
    Path(thread_id): Path<String>,
) -> Result<Json<Vec<MessageRowView>>, ApiError> {
    require(&client, Permission::Admin)?;
    state.store.ensure_tenant(&tenant.tenant_id).await?;
    if state
        .store
        .get_thread(&tenant.tenant_id, &thread_id)
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound(format!("thread {thread_id:?} not found")));
    }
    let messages = state
        .store
        .thread_messages(&tenant.tenant_id, &thread_id)
        .await?;
    Ok(Json(messages.into_iter().map(Into::into).collect()))
}

#[derive(Debug, serde::Serialize)]
pub struct ThreadRowView {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub model: String,
    pub status: String,
    pub message_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl From<ThreadRow> for ThreadRowView {
    fn from(row: ThreadRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            provider: row.provider,
            model: row.model,
            status: row.status,
            message_count: row.message_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct MessageRowView {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub created_at: String,
}

impl From<MessageRow> for MessageRowView {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            thread_id: row.thread_id,
            role: row.role,
            content: row.content,
            model: row.model,
            total_tokens: row.total_tokens,
            cost_usd: row.cost_usd,
            created_at: row.created_at,
        }
    }
}
