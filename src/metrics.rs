//! Prometheus metrics for the gateway
//!
//! Provides observability metrics for production monitoring:
//! - RPC request counts and durations
//! - Authentication and quota decisions
//! - Provider API calls, retries, and token usage

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, HistogramVec, TextEncoder, register_counter_vec,
    register_histogram_vec,
};
use std::net::SocketAddr;
use tracing::{error, info};
use warp::Filter;

lazy_static! {
    /// RPC counts by method and outcome status.
    pub static ref RPC_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "airborne_rpc_requests_total",
        "Total number of RPC requests",
        &["method", "status"]
    )
    .unwrap();

    /// RPC duration histogram.
    pub static ref RPC_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "airborne_rpc_duration_seconds",
        "RPC processing duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    /// Authentication outcomes.
    pub static ref AUTH_ATTEMPTS_TOTAL: CounterVec = register_counter_vec!(
        "airborne_auth_attempts_total",
        "Total number of authentication attempts",
        &["result"]  // "success" or "failure"
    )
    .unwrap();

    /// Requests rejected by the quota engine.
    pub static ref QUOTA_REJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "airborne_quota_rejections_total",
        "Total number of quota rejections",
        &["scope"]
    )
    .unwrap();

    /// Provider API call counts.
    pub static ref PROVIDER_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "airborne_provider_requests_total",
        "Total number of provider API requests",
        &["provider", "kind"]  // kind: "generate" or "generate_stream"
    )
    .unwrap();

    /// Retry attempts for transient outbound failures.
    pub static ref RETRY_ATTEMPTS_TOTAL: CounterVec = register_counter_vec!(
        "airborne_retry_attempts_total",
        "Total number of outbound retry attempts",
        &["provider", "reason"]
    )
    .unwrap();

    /// Token usage per provider.
    pub static ref TOKENS_TOTAL: CounterVec = register_counter_vec!(
        "airborne_tokens_total",
        "Total number of tokens processed",
        &["provider"]
    )
    .unwrap();
}

/// Record one finished RPC.
pub fn record_rpc(method: &str, status: u16, seconds: f64) {
    RPC_REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
    RPC_DURATION_SECONDS
        .with_label_values(&[method])
        .observe(seconds);
}

pub fn record_auth_attempt(success: bool) {
    let result = if success { "success" } else { "failure" };
    AUTH_ATTEMPTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_quota_rejection(scope: &str) {
    QUOTA_REJECTIONS_TOTAL.with_label_values(&[scope]).inc();
}

pub fn record_provider_call(provider: &str, kind: &str) {
    PROVIDER_REQUESTS_TOTAL
        .with_label_values(&[provider, kind])
        .inc();
}

pub fn record_provider_retry(provider: &str, reason: &str) {
    RETRY_ATTEMPTS_TOTAL
        .with_label_values(&[provider, reason])
        .inc();
}

pub fn record_tokens(provider: &str, total_tokens: u64) {
    if total_tokens > 0 {
        TOKENS_TOTAL
            .with_label_values(&[provider])
            .inc_by(total_tokens as f64);
    }
}

/// Serve `/metrics` on a dedicated listener until the process exits.
pub async fn start_metrics_server(addr: SocketAddr) {
    let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "error encoding metrics");
            return warp::reply::with_status(
                "Error encoding metrics".to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            );
        }
        warp::reply::with_status(
            String::from_utf8_lossy(&buffer).to_string(),
            warp::http::StatusCode::OK,
        )
    });

    info!(%addr, "metrics server listening");
    warp::serve(metrics_route).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_does_not_panic() {
        record_rpc("chat.generate", 200, 0.05);
        record_auth_attempt(true);
        record_auth_attempt(false);
        record_quota_rejection("requests_per_minute");
        record_provider_call("anthropic", "generate");
        record_provider_retry("anthropic", "server_error");
        record_tokens("anthropic", 42);
        record_tokens("anthropic", 0);
    }
}
