//! End-to-end request-plane tests against the assembled router, with a
//! scripted provider standing in for the upstream vendors.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tower::ServiceExt;

use airborne::auth::{AuthMode, Authenticator};
use airborne::chat::{ChatOrchestrator, ProviderCatalog};
use airborne::config::QuotaDefaults;
use airborne::pricing::PricingEngine;
use airborne::providers::{
    CallContext, GenerateParams, GenerateResult, Provider, ProviderError, StreamChunk, Usage,
};
use airborne::quota::{MemoryCounterStore, QuotaEngine};
use airborne::secret::SecretString;
use airborne::secrets::SecretResolver;
use airborne::server::{AppState, build_router};
use airborne::store::ConversationStore;
use airborne::tenant::{TenantLoader, TenantRegistry, TenantSource};
use airborne::validate::SsrfValidator;

const ADMIN_BEARER: &str = "test-admin-bearer";

/// Provider that answers from a script and counts invocations.
struct ScriptedProvider {
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }
    fn supports_file_search(&self) -> bool {
        false
    }
    fn supports_web_search(&self) -> bool {
        false
    }
    fn supports_native_continuity(&self) -> bool {
        false
    }
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        _ctx: CallContext,
        params: GenerateParams,
    ) -> Result<GenerateResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerateResult {
            text: "Hello".into(),
            response_id: Some("resp_1".into()),
            usage: Usage {
                input_tokens: 5,
                output_tokens: 2,
                total_tokens: 7,
            },
            model: params.model().to_string(),
            ..Default::default()
        })
    }

    async fn generate_stream(
        &self,
        _ctx: CallContext,
        params: GenerateParams,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        let model = params.model().to_string();
        tokio::spawn(async move {
            let _ = tx.send(StreamChunk::Text { delta: "Hel".into() }).await;
            let _ = tx.send(StreamChunk::Text { delta: "lo".into() }).await;
            let _ = tx
                .send(StreamChunk::Complete {
                    response_id: Some("resp_s1".into()),
                    model,
                    usage: Usage {
                        input_tokens: 5,
                        output_tokens: 2,
                        total_tokens: 7,
                    },
                    tool_calls: Vec::new(),
                    code_executions: Vec::new(),
                })
                .await;
        });
        Ok(rx)
    }
}

struct FixedCatalog(Arc<ScriptedProvider>);

impl ProviderCatalog for FixedCatalog {
    fn get(&self, _name: &str) -> Arc<dyn Provider> {
        self.0.clone()
    }
}

fn write_tenant(dir: &Path, id: &str) {
    let body = serde_json::json!({
        "tenant_id": id,
        "providers": {
            "anthropic": {
                "enabled": true,
                "api_key": "inline-test-key",
                "model": "claude-sonnet-4-5"
            }
        },
        "default_provider": "anthropic"
    });
    std::fs::write(
        dir.join(format!("{id}.json")),
        serde_json::to_string(&body).unwrap(),
    )
    .unwrap();
}

struct Harness {
    router: axum::Router,
    provider: Arc<ScriptedProvider>,
    _tenant_dir: tempfile::TempDir,
    _pricing_dir: tempfile::TempDir,
}

/// Assemble the whole request plane with in-process fakes for the
/// external stores. `dev_auth` adds the synthetic non-admin client.
async fn harness(defaults: QuotaDefaults, dev_auth: bool) -> Harness {
    let tenant_dir = tempfile::tempdir().unwrap();
    write_tenant(tenant_dir.path(), "acme");

    let pricing_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        pricing_dir.path().join("anthropic_pricing.json"),
        r#"{"claude-sonnet-4-5": {"input_per_million": 3.0, "output_per_million": 15.0}}"#,
    )
    .unwrap();

    let loader = TenantLoader::new(
        TenantSource::Dir(tenant_dir.path().to_path_buf()),
        SecretResolver::default(),
    );
    let registry = Arc::new(TenantRegistry::load(loader).await.unwrap());

    let provider = Arc::new(ScriptedProvider::new());
    let quota = Arc::new(QuotaEngine::new(
        Arc::new(MemoryCounterStore::default()),
        defaults,
    ));
    let pricing = Arc::new(PricingEngine::load_dir(pricing_dir.path()).unwrap());
    let store = Arc::new(
        ConversationStore::connect_with("sqlite::memory:", 1)
            .await
            .unwrap(),
    );

    let orchestrator = Arc::new(ChatOrchestrator::new(
        registry,
        Arc::new(FixedCatalog(provider.clone())),
        quota,
        pricing,
        store.clone(),
        None,
        Arc::new(SsrfValidator::default()),
        false,
    ));

    let authenticator = Authenticator::new(
        AuthMode::Static {
            token: SecretString::from(ADMIN_BEARER),
        },
        dev_auth,
    );

    let state = AppState {
        orchestrator,
        authenticator: Arc::new(authenticator),
        credential_store: None,
        rag: None,
        store,
    };

    Harness {
        router: build_router(state),
        provider,
        _tenant_dir: tenant_dir,
        _pricing_dir: pricing_dir,
    }
}

fn chat_request(path: &str, body: serde_json::Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-tenant-id", "acme");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn sse_events(raw: &str) -> Vec<serde_json::Value> {
    raw.split("\n\n")
        .filter_map(|block| {
            let data: String = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|rest| rest.trim_start())
                .collect();
            if data.is_empty() {
                None
            } else {
                serde_json::from_str(&data).ok()
            }
        })
        .collect()
}

#[tokio::test]
async fn unary_turn_succeeds_and_persists() {
    let h = harness(QuotaDefaults::default(), false).await;

    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": "hi"}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["text"], "Hello");
    assert_eq!(body["usage"]["total_tokens"], 7);
    assert_eq!(body["provider"], "anthropic");
    // Known model: cost computed, not unknown.
    assert_eq!(body["cost_unknown"], false);
    let thread_id = body["thread_id"].as_str().unwrap().to_string();

    // The persisted thread holds exactly one user and one assistant
    // message, and message_count agrees.
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/chat/threads")
                .header("x-tenant-id", "acme")
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN_BEARER}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let threads = body_json(response).await;
    assert_eq!(threads.as_array().unwrap().len(), 1);
    assert_eq!(threads[0]["id"], thread_id.as_str());
    assert_eq!(threads[0]["message_count"], 2);

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/v1/chat/threads/{thread_id}/messages"))
                .header("x-tenant-id", "acme")
                .header(header::AUTHORIZATION, format!("Bearer {ADMIN_BEARER}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let messages = body_json(response).await;
    let roles: Vec<&str> = messages
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "assistant"]);
}

#[tokio::test]
async fn missing_bearer_is_unauthenticated() {
    let h = harness(QuotaDefaults::default(), false).await;
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": "hi"}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_tenant_is_unauthenticated() {
    let h = harness(QuotaDefaults::default(), false).await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-tenant-id", "ghost")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_BEARER}"))
        .body(Body::from(
            serde_json::json!({"user_input": "hi"}).to_string(),
        ))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rpm_quota_rejects_third_request() {
    let h = harness(
        QuotaDefaults {
            rpm: 2,
            rpd: 0,
            tpm: 0,
        },
        false,
    )
    .await;

    for _ in 0..2 {
        let response = h
            .router
            .clone()
            .oneshot(chat_request(
                "/v1/chat/generate",
                serde_json::json!({"user_input": "hi"}),
                Some(ADMIN_BEARER),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": "hi"}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "RESOURCE_EXHAUSTED");
    // The provider never saw the rejected request.
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn user_input_size_boundary_is_exact() {
    let h = harness(QuotaDefaults::default(), false).await;

    let at_limit = "x".repeat(100 * 1024);
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": at_limit}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let over_limit = "x".repeat(100 * 1024 + 1);
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": over_limit}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_ARGUMENT");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("user_input"));
}

#[tokio::test]
async fn custom_base_url_requires_admin_before_ssrf() {
    // dev_auth gives unauthenticated callers a synthetic client without
    // Admin.
    let h = harness(QuotaDefaults::default(), true).await;

    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({
                "user_input": "hi",
                "base_url": "http://169.254.169.254/"
            }),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "PERMISSION_DENIED");
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);

    // Even Admin cannot reach metadata space: SSRF rejects it.
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({
                "user_input": "hi",
                "base_url": "https://169.254.169.254/"
            }),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_orders_chunks_and_accounts_tokens_once() {
    // tpm=7: one stream's worth of tokens exactly fills the window.
    let h = harness(
        QuotaDefaults {
            rpm: 0,
            rpd: 0,
            tpm: 7,
        },
        false,
    )
    .await;

    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/stream",
            serde_json::json!({"user_input": "say hello"}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let raw = String::from_utf8(
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec(),
    )
    .unwrap();

    let events = sse_events(&raw);
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["text", "text", "complete"]);
    assert_eq!(events[0]["delta"], "Hel");
    assert_eq!(events[1]["delta"], "lo");
    assert_eq!(events[2]["usage"]["total_tokens"], 7);

    // 7 recorded tokens == the limit: the next request still passes, so
    // the stream recorded exactly once (a double increment would be 14).
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": "hi"}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // That unary turn added 7 more; now the window is over budget.
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": "hi"}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn select_provider_is_advisory() {
    let h = harness(QuotaDefaults::default(), false).await;
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/select-provider",
            serde_json::json!({}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["provider"], "anthropic");
    assert_eq!(body["model"], "claude-sonnet-4-5");
    // Advisory only: no provider call happened.
    assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_provider_override_is_invalid_argument() {
    let h = harness(QuotaDefaults::default(), false).await;
    let response = h
        .router
        .clone()
        .oneshot(chat_request(
            "/v1/chat/generate",
            serde_json::json!({"user_input": "hi", "provider": "nonexistent"}),
            Some(ADMIN_BEARER),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoints_skip_auth() {
    let h = harness(QuotaDefaults::default(), false).await;
    for path in ["/healthz", "/readyz", "/version"] {
        let response = h
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(path)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
}

#[tokio::test]
async fn reload_during_concurrent_generates() {
    let h = harness(QuotaDefaults::default(), false).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let router = h.router.clone();
        tasks.push(tokio::spawn(async move {
            router
                .oneshot(chat_request(
                    "/v1/chat/generate",
                    serde_json::json!({"user_input": "hi"}),
                    Some(ADMIN_BEARER),
                ))
                .await
                .unwrap()
                .status()
        }));
    }

    let reload = h.router.clone().oneshot(
        Request::builder()
            .method("POST")
            .uri("/v1/admin/tenants/reload")
            .header(header::AUTHORIZATION, format!("Bearer {ADMIN_BEARER}"))
            .body(Body::empty())
            .unwrap(),
    );
    let reload_status = reload.await.unwrap().status();
    assert_eq!(reload_status, StatusCode::OK);

    for task in tasks {
        // Every in-flight request saw either the old or new map; none
        // observed a missing tenant.
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }
}
