//! HTTP ingress: router assembly, shared state, graceful serve.

pub mod admin_routes;
pub mod chat_routes;
pub mod error;
pub mod file_routes;
pub mod middleware;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::info;

use crate::auth::{AuthenticatedClient, Authenticator, CredentialStore, Permission};
use crate::chat::ChatOrchestrator;
use crate::rag::RagService;
use crate::server::error::ApiError;
use crate::store::ConversationStore;

/// Uploads dominate body size; chat payloads are limited separately by
/// the validator.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub authenticator: Arc<Authenticator>,
    pub credential_store: Option<Arc<CredentialStore>>,
    pub rag: Option<Arc<RagService>>,
    pub store: Arc<ConversationStore>,
}

/// Per-handler permission check.
pub fn require(client: &AuthenticatedClient, permission: Permission) -> Result<(), ApiError> {
    if client.has_permission(permission) {
        Ok(())
    } else {
        Err(ApiError::PermissionDenied)
    }
}

/// Assemble the full router with the interceptor chain.
///
/// Layer order is load-bearing; layers added later run earlier, so the
/// resulting order is recovery → logging → tenant → auth → quota, with
/// permission checks inside each handler.
pub fn build_router(state: AppState) -> Router {
    let tenant_scoped = Router::new()
        .route("/v1/chat/generate", post(chat_routes::generate))
        .route("/v1/chat/stream", post(chat_routes::generate_stream))
        .route("/v1/chat/select-provider", post(chat_routes::select_provider))
        .route("/v1/chat/threads", get(chat_routes::list_threads))
        .route(
            "/v1/chat/threads/{thread_id}/messages",
            get(chat_routes::thread_messages),
        )
        .route(
            "/v1/files/stores",
            post(file_routes::create_store).get(file_routes::list_stores),
        )
        .route(
            "/v1/files/stores/{store_id}",
            get(file_routes::get_store).delete(file_routes::delete_store),
        )
        .route("/v1/files/stores/{store_id}/upload", post(file_routes::upload))
        .layer(from_fn_with_state(state.clone(), middleware::enforce_quota))
        .layer(from_fn_with_state(state.clone(), middleware::authenticate))
        .layer(from_fn_with_state(state.clone(), middleware::resolve_tenant));

    // Key management and reload are deployment-global: authenticated but
    // not tenant-scoped.
    let admin_scoped = Router::new()
        .route(
            "/v1/admin/keys",
            post(admin_routes::mint_key).get(admin_routes::list_keys),
        )
        .route("/v1/admin/keys/{client_id}", delete(admin_routes::revoke_key))
        .route("/v1/admin/tenants/reload", post(admin_routes::reload_tenants))
        .layer(from_fn_with_state(state.clone(), middleware::authenticate));

    Router::new()
        .route("/healthz", get(admin_routes::healthz))
        .route("/readyz", get(admin_routes::readyz))
        .route("/version", get(admin_routes::version))
        .merge(tenant_scoped)
        .merge(admin_scoped)
        .layer(from_fn(middleware::log_requests))
        .layer(CatchPanicLayer::custom(
            |panic: Box<dyn std::any::Any + Send + 'static>| {
                middleware::panic_to_internal(panic)
            },
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves, then drain in-flight
/// requests.
pub async fn serve(
    state: AppState,
    listen_addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = listen_addr, "gateway listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("gateway drained and stopped");
    Ok(())
}
