//! Chat orchestration: one place that runs a turn end to end.
//!
//! validate → select provider → retrieve context → invoke adapter →
//! compute cost → record tokens → persist the turn. Streaming follows the
//! same path but relays chunks while buffering text and usage, finishing
//! accounting when the terminal `Complete` arrives. A cancelled stream
//! never persists a partial turn, and accounting runs at most once per
//! turn regardless of adapter-internal retries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::auth::{AuthenticatedClient, Permission};
use crate::metrics;
use crate::pricing::PricingEngine;
use crate::providers::{
    CallContext, ChatTurn, Citation, CustomTool, GenerateParams, InlineImage, Provider,
    ProviderError, StreamChunk, Usage, provider_by_name,
};
use crate::quota::{QuotaEngine, QuotaExceeded};
use crate::rag::RagService;
use crate::store::{ConversationStore, TurnRecord};
use crate::tenant::{ProviderConfig, TenantConfig, TenantRegistry};
use crate::validate::{SsrfValidator, ValidationError, normalize_request_id, validate_chat_sizes};

/// Inbound chat request DTO.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChatRequest {
    pub user_input: String,
    pub instructions: String,
    pub history: Vec<ChatTurn>,
    /// Explicit provider override; otherwise tenant default, then the
    /// first enabled failover entry.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub thread_id: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub file_store_id: Option<String>,
    pub previous_response_id: Option<String>,
    pub enable_web_search: bool,
    pub enable_file_search: bool,
    /// Custom endpoint override. Requires Admin and passes SSRF checks.
    pub base_url: Option<String>,
    pub inline_images: Vec<InlineImage>,
    pub custom_tools: Vec<CustomTool>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub text: String,
    pub thread_id: String,
    pub request_id: String,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub usage: Usage,
    pub cost_usd: f64,
    pub cost_unknown: bool,
    pub citations: Vec<Citation>,
    pub processing_time_ms: u64,
}

/// Advisory result of provider selection.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSelection {
    pub provider: String,
    pub model: String,
    /// The full chain that would be consulted, selection first.
    pub chain: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("provider {0:?} is not configured or not enabled for this tenant")]
    UnknownProvider(String),
    #[error("tenant has no enabled provider")]
    NoProviderAvailable,
    #[error(transparent)]
    Quota(#[from] QuotaExceeded),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("internal error")]
    Internal(anyhow::Error),
}

/// Adapter lookup seam so tests can script vendors.
pub trait ProviderCatalog: Send + Sync {
    fn get(&self, name: &str) -> Arc<dyn Provider>;
}

/// The real catalogue: the built-in adapters by name, OpenAI-compatible
/// fallback for everything else.
pub struct DefaultCatalog;

impl ProviderCatalog for DefaultCatalog {
    fn get(&self, name: &str) -> Arc<dyn Provider> {
        provider_by_name(name)
    }
}

pub struct ChatOrchestrator {
    registry: Arc<TenantRegistry>,
    catalog: Arc<dyn ProviderCatalog>,
    quota: Arc<QuotaEngine>,
    pricing: Arc<PricingEngine>,
    store: Arc<ConversationStore>,
    rag: Option<Arc<RagService>>,
    ssrf: Arc<SsrfValidator>,
    capture: bool,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TenantRegistry>,
        catalog: Arc<dyn ProviderCatalog>,
        quota: Arc<QuotaEngine>,
        pricing: Arc<PricingEngine>,
        store: Arc<ConversationStore>,
        rag: Option<Arc<RagService>>,
        ssrf: Arc<SsrfValidator>,
        capture: bool,
    ) -> Self {
        Self {
            registry,
            catalog,
            quota,
            pricing,
            store,
            rag,
            ssrf,
            capture,
        }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn quota(&self) -> &Arc<QuotaEngine> {
        &self.quota
    }

    /// Step 2: explicit request override > tenant default > first enabled
    /// failover entry.
    pub fn select_provider(
        &self,
        tenant: &TenantConfig,
        explicit: Option<&str>,
    ) -> Result<ProviderSelection, ChatError> {
        if let Some(name) = explicit.filter(|n| !n.is_empty()) {
            let config = tenant
                .providers
                .get(name)
                .filter(|p| p.enabled)
                .ok_or_else(|| ChatError::UnknownProvider(name.to_string()))?;
            return Ok(ProviderSelection {
                provider: name.to_string(),
                model: config.model.clone(),
                chain: vec![name.to_string()],
            });
        }

        let chain: Vec<String> = tenant.provider_chain().iter().map(|s| s.to_string()).collect();
        let first = chain.first().ok_or(ChatError::NoProviderAvailable)?;
        let config = tenant
            .providers
            .get(first)
            .ok_or(ChatError::NoProviderAvailable)?;
        Ok(ProviderSelection {
            provider: first.clone(),
            model: config.model.clone(),
            chain,
        })
    }

    /// Steps 1–3 shared by unary and streaming: validation, permission
    /// escalation for custom endpoints, provider selection, retrieval.
    async fn prepare(
        &self,
        tenant: &TenantConfig,
        client: &AuthenticatedClient,
        request: &ChatRequest,
    ) -> Result<PreparedCall, ChatError> {
        validate_chat_sizes(
            &request.user_input,
            &request.instructions,
            request.history.len(),
            &request.metadata,
        )?;
        let request_id = normalize_request_id(request.request_id.as_deref());

        let selection = self.select_provider(tenant, request.provider.as_deref())?;
        let mut provider_config: ProviderConfig = tenant
            .providers
            .get(&selection.provider)
            .cloned()
            .ok_or(ChatError::NoProviderAvailable)?;

        // Custom endpoints are privileged: only Admin may redirect traffic,
        // and even Admin only to SSRF-safe hosts.
        if let Some(base_url) = request.base_url.as_deref().filter(|u| !u.is_empty()) {
            if !client.has_permission(Permission::Admin) {
                return Err(ChatError::PermissionDenied(
                    "custom base_url requires Admin",
                ));
            }
            self.ssrf.validate_base_url(base_url)?;
            provider_config.base_url = Some(base_url.to_string());
        } else if let Some(configured) = provider_config.base_url.as_deref() {
            self.ssrf.validate_base_url(configured)?;
        }

        // Step 3: retrieval, only when the tenant has RAG wired up and the
        // request asks for file search. Failures degrade to an
        // unaugmented prompt.
        let mut instructions = request.instructions.clone();
        let mut citations = Vec::new();
        if request.enable_file_search {
            if let (Some(rag), Some(store_id)) = (
                self.rag.as_ref(),
                request.file_store_id.as_deref().filter(|s| !s.is_empty()),
            ) {
                match rag
                    .retrieve(&tenant.tenant_id, store_id, &request.user_input, None)
                    .await
                {
                    Ok(chunks) if !chunks.is_empty() => {
                        let mut preamble =
                            String::from("Use the following retrieved context when relevant:\n");
                        for chunk in &chunks {
                            preamble.push_str(&format!("\n[{}] {}\n", chunk.source, chunk.text));
                            citations.push(Citation {
                                source: chunk.source.clone(),
                                snippet: Some(truncate_snippet(&chunk.text)),
                                score: Some(chunk.score),
                            });
                        }
                        if instructions.is_empty() {
                            instructions = preamble;
                        } else {
                            instructions = format!("{instructions}\n\n{preamble}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(tenant = %tenant.tenant_id, store = store_id, error = %e,
                            "retrieval failed, continuing without context");
                    }
                }
            }
        }

        let params = GenerateParams {
            instructions,
            user_input: request.user_input.clone(),
            history: request.history.clone(),
            file_store_id: request.file_store_id.clone(),
            previous_response_id: request.previous_response_id.clone(),
            override_model: request.model.clone(),
            enable_web_search: request.enable_web_search,
            enable_file_search: request.enable_file_search,
            file_id_to_filename: HashMap::new(),
            inline_images: request.inline_images.clone(),
            custom_tools: request.custom_tools.clone(),
            provider_config,
            request_id: request_id.clone(),
            client_id: client.client_id.clone(),
        };

        Ok(PreparedCall {
            provider_name: selection.provider,
            params,
            citations,
            request_id,
        })
    }

    /// Unary turn, steps 1–8.
    pub async fn generate(
        &self,
        tenant: &TenantConfig,
        client: &AuthenticatedClient,
        request: ChatRequest,
        ctx: CallContext,
    ) -> Result<ChatResponse, ChatError> {
        let started = Instant::now();
        let prepared = self.prepare(tenant, client, &request).await?;
        let provider = self.catalog.get(&prepared.provider_name);

        let ctx = CallContext {
            capture: self.capture,
            ..ctx
        };
        let result = provider.generate(ctx, prepared.params.clone()).await?;
        metrics::record_provider_call(&prepared.provider_name, "generate");

        let cost = self
            .pricing
            .calculate(&result.model, result.usage.input_tokens, result.usage.output_tokens);
        self.quota
            .record_tokens(&client.client_id, result.usage.total_tokens)
            .await;
        metrics::record_tokens(&prepared.provider_name, result.usage.total_tokens);

        let mut citations = prepared.citations.clone();
        citations.extend(result.citations.clone());

        let turn = TurnRecord {
            thread_id: request.thread_id.clone(),
            user_id: request
                .user_id
                .clone()
                .unwrap_or_else(|| client.client_id.clone()),
            provider: prepared.provider_name.clone(),
            model: result.model.clone(),
            user_content: request.user_input.clone(),
            assistant_content: result.text.clone(),
            response_id: result.response_id.clone(),
            usage: result.usage,
            cost_usd: Some(cost.as_f64()),
            processing_time_ms: Some(started.elapsed().as_millis() as i64),
            citations: citations.clone(),
            system_prompt: Some(prepared.params.instructions.clone()),
            raw_request: result.raw_request.clone(),
            raw_response: result.raw_response.clone(),
        };
        let thread_id = self.persist_best_effort(&tenant.tenant_id, &turn).await;

        Ok(ChatResponse {
            text: result.text,
            thread_id,
            request_id: prepared.request_id,
            provider: prepared.provider_name,
            model: result.model,
            response_id: result.response_id,
            usage: result.usage,
            cost_usd: cost.as_f64(),
            cost_unknown: cost.unknown,
            citations,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Streaming turn: relay chunks downstream; account and persist once
    /// on `Complete`, before the downstream channel closes.
    pub async fn generate_stream(
        &self,
        tenant: &TenantConfig,
        client: &AuthenticatedClient,
        request: ChatRequest,
        ctx: CallContext,
    ) -> Result<mpsc::Receiver<StreamChunk>, ChatError> {
        let started = Instant::now();
        let prepared = self.prepare(tenant, client, &request).await?;
        let provider = self.catalog.get(&prepared.provider_name);

        let ctx = CallContext {
            capture: self.capture,
            ..ctx
        };
        let mut upstream = provider.generate_stream(ctx, prepared.params.clone()).await?;
        metrics::record_provider_call(&prepared.provider_name, "generate_stream");

        let (tx, rx) = mpsc::channel(crate::providers::STREAM_CHANNEL_CAPACITY);
        let orchestrator = OrchestratorHandles {
            quota: self.quota.clone(),
            pricing: self.pricing.clone(),
            store: self.store.clone(),
        };
        let tenant_id = tenant.tenant_id.clone();
        let client_id = client.client_id.clone();
        let user_id = request
            .user_id
            .clone()
            .unwrap_or_else(|| client.client_id.clone());
        let thread_id = request.thread_id.clone();
        let user_input = request.user_input.clone();
        let prepared_citations = prepared.citations.clone();
        let provider_name = prepared.provider_name.clone();
        let instructions = prepared.params.instructions.clone();

        tokio::spawn(async move {
            let mut buffered_text = String::new();
            while let Some(chunk) = upstream.recv().await {
                match &chunk {
                    StreamChunk::Text { delta } => {
                        buffered_text.push_str(delta);
                    }
                    StreamChunk::Complete {
                        response_id,
                        model,
                        usage,
                        ..
                    } => {
                        // Steps 5–7, exactly once per stream.
                        let cost = orchestrator.pricing.calculate(
                            model,
                            usage.input_tokens,
                            usage.output_tokens,
                        );
                        orchestrator
                            .quota
                            .record_tokens(&client_id, usage.total_tokens)
                            .await;
                        metrics::record_tokens(&provider_name, usage.total_tokens);

                        let turn = TurnRecord {
                            thread_id: thread_id.clone(),
                            user_id: user_id.clone(),
                            provider: provider_name.clone(),
                            model: model.clone(),
                            user_content: user_input.clone(),
                            assistant_content: buffered_text.clone(),
                            response_id: response_id.clone(),
                            usage: *usage,
                            cost_usd: Some(cost.as_f64()),
                            processing_time_ms: Some(started.elapsed().as_millis() as i64),
                            citations: prepared_citations.clone(),
                            system_prompt: Some(instructions.clone()),
                            raw_request: None,
                            raw_response: None,
                        };
                        if let Err(e) = orchestrator.store.ensure_tenant(&tenant_id).await {
                            error!(tenant = %tenant_id, error = %e,
                                "turn persistence failed after successful stream");
                        } else if let Err(e) =
                            orchestrator.store.persist_turn(&tenant_id, &turn).await
                        {
                            error!(tenant = %tenant_id, user_content = %turn.user_content,
                                assistant_len = turn.assistant_content.len(), error = %e,
                                "turn persistence failed after successful stream");
                        }
                    }
                    _ => {}
                }
                let terminal = matches!(
                    chunk,
                    StreamChunk::Complete { .. } | StreamChunk::Error { .. }
                );
                if tx.send(chunk).await.is_err() {
                    // Downstream went away; stop reading, emitter sees the
                    // closed channel and cleans up upstream.
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Step 7 with the partial-failure rule: a persistence error never
    /// takes down a turn the provider already answered.
    async fn persist_best_effort(&self, tenant_id: &str, turn: &TurnRecord) -> String {
        let attempt = async {
            self.store.ensure_tenant(tenant_id).await?;
            self.store.persist_turn(tenant_id, turn).await
        };
        match attempt.await {
            Ok(thread_id) => thread_id,
            Err(e) => {
                error!(
                    tenant = tenant_id,
                    user_content = %turn.user_content,
                    assistant_len = turn.assistant_content.len(),
                    error = %e,
                    "turn persistence failed; reply still delivered"
                );
                turn.thread_id.clone().unwrap_or_default()
            }
        }
    }
}

struct PreparedCall {
    provider_name: String,
    params: GenerateParams,
    citations: Vec<Citation>,
    request_id: String,
}

struct OrchestratorHandles {
    quota: Arc<QuotaEngine>,
    pricing: Arc<PricingEngine>,
    store: Arc<ConversationStore>,
}

fn truncate_snippet(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.chars().count() <= LIMIT {
        text.to_string()
    } else {
        let cut: String = text.chars().take(LIMIT).collect();
        format!("{cut}…")
    }
}
