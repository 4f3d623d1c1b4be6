//! The interceptor chain.
//!
//! Fixed order per RPC: recovery → logging → tenant → auth, with quota
//! checks on the chat/files routes and per-handler permission checks.
//! The order is load-bearing: recovery must see everything, logging must
//! time everything, tenant context must exist before auth decisions are
//! recorded against it, and quota needs the authenticated client.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::auth::AuthenticatedClient;
use crate::metrics;
use crate::server::error::ApiError;
use crate::server::AppState;
use crate::tenant::TenantConfig;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Paths whose logging is noise at info level.
fn is_health_path(path: &str) -> bool {
    matches!(path, "/healthz" | "/readyz")
}

/// Recovery: a panicking handler becomes a logged `Internal`, never a
/// torn connection.
pub fn panic_to_internal(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    let backtrace = std::backtrace::Backtrace::force_capture().to_string();
    let bounded: String = backtrace.chars().take(4096).collect();
    error!(panic = %message, backtrace = %bounded, "handler panicked");
    ApiError::Internal.into_response()
}

/// Logging: method, path, status, duration. Health probes log at debug.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    metrics::record_rpc(&path, status, elapsed.as_secs_f64());
    if is_health_path(&path) {
        debug!(%method, path, status, duration_ms = elapsed.as_millis() as u64, "rpc");
    } else {
        info!(%method, path, status, duration_ms = elapsed.as_millis() as u64, "rpc");
    }
    response
}

/// Tenant resolution: `x-tenant-id` header, defaulted in single-tenant
/// deployments. Unknown tenants are indistinguishable from bad
/// credentials.
pub async fn resolve_tenant(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let registry = state.orchestrator.registry();
    let header_value = header_str(req.headers(), TENANT_HEADER);
    let tenant_id = match header_value {
        Some(id) => id,
        None => match registry.sole_tenant_id() {
            Some(id) => id,
            None => return ApiError::Unauthenticated.into_response(),
        },
    };

    let Some(tenant) = registry.get(&tenant_id) else {
        debug!(tenant = %tenant_id, "unknown tenant");
        return ApiError::Unauthenticated.into_response();
    };

    req.extensions_mut().insert::<Arc<TenantConfig>>(tenant);
    next.run(req).await
}

/// Authentication: bearer token from `authorization`.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let bearer = header_str(req.headers(), "authorization")
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v.as_str()).to_string());

    match state.authenticator.authenticate(bearer.as_deref()) {
        Ok(client) => {
            metrics::record_auth_attempt(true);
            req.extensions_mut().insert::<AuthenticatedClient>(client);
            next.run(req).await
        }
        Err(_) => {
            metrics::record_auth_attempt(false);
            ApiError::Unauthenticated.into_response()
        }
    }
}

/// Quota admission for the chat/files routes. Runs after auth so the
/// client's overrides apply.
pub async fn enforce_quota(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(client) = req.extensions().get::<AuthenticatedClient>() else {
        return ApiError::Unauthenticated.into_response();
    };

    if let Err(exceeded) = state
        .orchestrator
        .quota()
        .check_request(&client.client_id, client.rate_limits)
        .await
    {
        return ApiError::from(exceeded).into_response();
    }
    next.run(req).await
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
