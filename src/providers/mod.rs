//! Uniform provider abstraction over the upstream LLM vendors.
//!
//! Every vendor adapter implements [`Provider`]: one unary `generate` and
//! one `generate_stream` that feeds a bounded channel of [`StreamChunk`]s.
//! The adapters share the retry engine, per-attempt deadlines, parameter
//! mapping, history truncation, and debug capture; what differs per
//! vendor is request/response shape and capability flags.

mod anthropic;
mod compat;
mod gemini;
mod history;
mod openai;

pub use anthropic::AnthropicProvider;
pub use compat::CompatProvider;
pub use gemini::GeminiProvider;
pub use history::{HISTORY_CHAR_BUDGET, replay_history, truncate_keep_newest};
pub use openai::OpenAiProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics;
use crate::retry::{RetryDecision, RetryPolicy, RetryReason, parse_retry_after, retry_with_backoff};
use crate::secret::ExposeSecret;
use crate::tenant::ProviderConfig;

/// Default unary/stream deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Deadline when extended thinking is enabled.
pub const THINKING_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Bounded channel size for stream chunks.
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One prior conversation turn replayed to a vendor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Base64 image attached to the current user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineImage {
    pub media_type: String,
    pub data_base64: String,
}

/// Operator-defined function tool with a JSON-schema parameters object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl CustomTool {
    /// Parameters object, with malformed schemas replaced by the empty
    /// object schema.
    pub fn safe_parameters(&self) -> serde_json::Value {
        if self.parameters.is_object() {
            self.parameters.clone()
        } else {
            warn!(tool = %self.name, "malformed tool schema replaced with empty object");
            serde_json::json!({"type": "object", "properties": {}})
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExecutionRecord {
    pub id: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Adapter-facing request DTO.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub instructions: String,
    pub user_input: String,
    pub history: Vec<ChatTurn>,
    pub file_store_id: Option<String>,
    pub previous_response_id: Option<String>,
    pub override_model: Option<String>,
    pub enable_web_search: bool,
    pub enable_file_search: bool,
    pub file_id_to_filename: HashMap<String, String>,
    pub inline_images: Vec<InlineImage>,
    pub custom_tools: Vec<CustomTool>,
    pub provider_config: ProviderConfig,
    pub request_id: String,
    pub client_id: String,
}

impl GenerateParams {
    /// The model actually sent upstream: request override wins over the
    /// tenant's configured model.
    pub fn model(&self) -> &str {
        self.override_model
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.provider_config.model)
    }
}

/// Adapter-facing response DTO.
#[derive(Debug, Clone, Default)]
pub struct GenerateResult {
    pub text: String,
    pub response_id: Option<String>,
    pub usage: Usage,
    pub citations: Vec<Citation>,
    pub model: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub code_executions: Vec<CodeExecutionRecord>,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
}

/// One event on a chat stream.
///
/// Contract: zero or more `Text` deltas in emission order, `ToolCall` and
/// `CodeExecution` as they complete, then exactly one of `Complete` or
/// `Error`, after which the channel closes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text {
        delta: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    CodeExecution {
        id: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Citation {
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        snippet: Option<String>,
    },
    Complete {
        response_id: Option<String>,
        model: String,
        usage: Usage,
        tool_calls: Vec<ToolCallRecord>,
        code_executions: Vec<CodeExecutionRecord>,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("provider rate limited")]
    RateLimited,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        retryable: bool,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider rejected credentials")]
    Auth,
    #[error("empty response body")]
    EmptyResponse,
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::RateLimited
                | Self::Transport(_)
                | Self::EmptyResponse
                | Self::Upstream { retryable: true, .. }
        )
    }
}

/// Runtime bits accompanying one adapter call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub cancel: CancellationToken,
    /// Caller deadline; adapters install a default when absent.
    pub deadline: Option<Duration>,
    /// Record raw request/response bodies.
    pub capture: bool,
}

impl CallContext {
    pub fn new(cancel: CancellationToken, deadline: Option<Duration>, capture: bool) -> Self {
        Self {
            cancel,
            deadline,
            capture,
        }
    }

    /// Per-attempt deadline: the caller's, or the thinking-aware default.
    pub fn attempt_timeout(&self, thinking: bool) -> Duration {
        self.deadline.unwrap_or(if thinking {
            THINKING_TIMEOUT
        } else {
            DEFAULT_TIMEOUT
        })
    }
}

/// Normalized generation options parsed from a provider's `extra_options`.
/// Unknown keys and out-of-vocabulary values are ignored with a warning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub reasoning_effort: Option<String>,
    pub service_tier: Option<String>,
    pub verbosity: Option<String>,
    pub prompt_cache_retention: Option<String>,
    pub thinking_enabled: bool,
    pub thinking_budget: Option<u32>,
    pub include_thoughts: bool,
    pub safety_threshold: Option<String>,
}

const REASONING_EFFORTS: &[&str] = &["none", "low", "medium", "high"];
const SERVICE_TIERS: &[&str] = &["default", "flex", "priority", "auto"];
const SAFETY_THRESHOLDS: &[&str] = &["BLOCK_NONE", "LOW", "MEDIUM", "ONLY_HIGH"];

/// Minimum accepted thinking budget; smaller configured values clamp up.
pub const MIN_THINKING_BUDGET: u32 = 1024;

impl GenerationOptions {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let map = &config.extra_options;
        let mut options = Self::default();

        options.reasoning_effort = pick_enum(map, "reasoning_effort", REASONING_EFFORTS);
        options.service_tier = pick_enum(map, "service_tier", SERVICE_TIERS);
        options.verbosity = pick_string(map, "verbosity");
        options.prompt_cache_retention = pick_string(map, "prompt_cache_retention");
        options.thinking_enabled = map
            .get("thinking_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        options.thinking_budget = map
            .get("thinking_budget")
            .and_then(|v| v.as_u64())
            .map(|b| (b as u32).max(MIN_THINKING_BUDGET));
        options.include_thoughts = map
            .get("include_thoughts")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        options.safety_threshold = pick_enum(map, "safety_threshold", SAFETY_THRESHOLDS);

        options
    }
}

fn pick_string(
    map: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    map.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn pick_enum(
    map: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    allowed: &[&str],
) -> Option<String> {
    let value = map.get(key)?.as_str()?;
    if allowed.contains(&value) {
        Some(value.to_string())
    } else {
        warn!(option = key, value, "ignoring out-of-vocabulary option value");
        None
    }
}

/// The uniform vendor contract.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn supports_file_search(&self) -> bool;
    fn supports_web_search(&self) -> bool;
    fn supports_native_continuity(&self) -> bool;
    fn supports_streaming(&self) -> bool;

    async fn generate(
        &self,
        ctx: CallContext,
        params: GenerateParams,
    ) -> Result<GenerateResult, ProviderError>;

    /// Start a stream. The returned receiver yields chunks per the
    /// ordering contract; the emitter task owns upstream cleanup and
    /// exits on cancellation.
    async fn generate_stream(
        &self,
        ctx: CallContext,
        params: GenerateParams,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError>;
}

/// Look up the adapter for a configured provider name. Unrecognized names
/// get the OpenAI-compatible adapter, which requires a `base_url`.
pub fn provider_by_name(name: &str) -> Arc<dyn Provider> {
    match name {
        "anthropic" => Arc::new(AnthropicProvider),
        "openai" => Arc::new(OpenAiProvider),
        "gemini" => Arc::new(GeminiProvider),
        other => Arc::new(CompatProvider::new(other)),
    }
}

/// Resolved API key for a call, or the auth error the vendor would give.
pub(crate) fn api_key(config: &ProviderConfig) -> Result<String, ProviderError> {
    config
        .resolved_api_key
        .as_ref()
        .map(|k| k.expose_secret().to_string())
        .ok_or(ProviderError::Auth)
}

// ── Shared HTTP plumbing ────────────────────────────────────────────────────

/// Body plus captured raw payloads from one successful exchange.
pub(crate) struct HttpOutcome {
    pub body: String,
    pub raw_request: Option<String>,
    pub raw_response: Option<String>,
}

type AttemptOutput = (reqwest::StatusCode, reqwest::header::HeaderMap, String);

fn classify_attempt(
    result: &Result<AttemptOutput, reqwest::Error>,
) -> RetryDecision {
    match result {
        Ok((status, headers, body)) => {
            if *status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return RetryDecision::Retry {
                    reason: RetryReason::RateLimited,
                    retry_after: parse_retry_after(headers),
                };
            }
            if status.is_server_error() {
                return RetryDecision::Retry {
                    reason: RetryReason::ServerError,
                    retry_after: parse_retry_after(headers),
                };
            }
            if status.is_success() && body.trim().is_empty() {
                return RetryDecision::Retry {
                    reason: RetryReason::EmptyResponse,
                    retry_after: None,
                };
            }
            RetryDecision::DoNotRetry
        }
        Err(err) => {
            if err.is_timeout() {
                return RetryDecision::Retry {
                    reason: RetryReason::Timeout,
                    retry_after: None,
                };
            }
            if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
                return RetryDecision::Retry {
                    reason: RetryReason::Connect,
                    retry_after: None,
                };
            }
            RetryDecision::DoNotRetry
        }
    }
}

/// POST a JSON body with the provider retry policy. A fresh client is
/// built per attempt so each carries its own deadline and capture state.
pub(crate) async fn post_json_with_retry(
    ctx: &CallContext,
    provider: &str,
    timeout: Duration,
    url: &str,
    headers: &[(&'static str, String)],
    body: &serde_json::Value,
) -> Result<HttpOutcome, ProviderError> {
    let policy = RetryPolicy::provider_default();
    let body_text = body.to_string();

    let result = retry_with_backoff(
        &policy,
        &ctx.cancel,
        |_attempt| {
            let body_text = body_text.clone();
            async move {
                let client = reqwest::Client::builder().timeout(timeout).build()?;
                let mut request = client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body_text);
                for (name, value) in headers {
                    request = request.header(*name, value.as_str());
                }
                let response = request.send().await?;
                let status = response.status();
                let resp_headers = response.headers().clone();
                let text = response.text().await?;
                Ok((status, resp_headers, text))
            }
        },
        classify_attempt,
        |attempt| {
            metrics::record_provider_retry(provider, attempt.reason.as_str());
            warn!(
                provider,
                attempt = attempt.attempt,
                delay_ms = attempt.delay.as_millis() as u64,
                reason = attempt.reason.as_str(),
                "provider request retrying"
            );
        },
    )
    .await;

    if ctx.cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }

    let (status, _headers, text) = result.map_err(|e: reqwest::Error| {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(e.to_string())
        }
    })?;

    finish_outcome(ctx, status, text, body_text)
}

fn finish_outcome(
    ctx: &CallContext,
    status: reqwest::StatusCode,
    text: String,
    request_body: String,
) -> Result<HttpOutcome, ProviderError> {
    if status.is_success() {
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        let (raw_request, raw_response) = if ctx.capture {
            (Some(request_body), Some(text.clone()))
        } else {
            (None, None)
        };
        return Ok(HttpOutcome {
            body: text,
            raw_request,
            raw_response,
        });
    }

    let message = truncate_error_body(&text);
    match status.as_u16() {
        401 | 403 => Err(ProviderError::Auth),
        429 => Err(ProviderError::RateLimited),
        400..=499 => Err(ProviderError::InvalidRequest(message)),
        code => Err(ProviderError::Upstream {
            status: code,
            message,
            retryable: true,
        }),
    }
}

fn truncate_error_body(body: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = body.trim();
    if trimmed.len() <= LIMIT {
        trimmed.to_string()
    } else {
        let mut end = LIMIT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    }
}

// ── Shared SSE plumbing ─────────────────────────────────────────────────────

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame parser over raw byte chunks.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..idx + 2).collect();
            let mut event_name = None;
            let mut data_lines = Vec::new();
            for line in block.lines() {
                let line = line.trim_end_matches('\r');
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
            if !data_lines.is_empty() || event_name.is_some() {
                events.push(SseEvent {
                    event: event_name,
                    data: data_lines.join("\n"),
                });
            }
        }
        events
    }
}

/// Send one chunk, giving up on cancellation or a dropped receiver.
/// Returns false when the emitter should stop.
pub(crate) async fn emit(
    tx: &mpsc::Sender<StreamChunk>,
    cancel: &CancellationToken,
    chunk: StreamChunk,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

/// Open an SSE POST stream: same retry policy as unary for establishing
/// the connection, then the caller consumes `bytes_stream`.
pub(crate) async fn open_sse_stream(
    ctx: &CallContext,
    provider: &str,
    timeout: Duration,
    url: &str,
    headers: &[(&'static str, String)],
    body: &serde_json::Value,
) -> Result<reqwest::Response, ProviderError> {
    let policy = RetryPolicy::provider_default();
    let body_text = body.to_string();

    let result = retry_with_backoff(
        &policy,
        &ctx.cancel,
        |_attempt| {
            let body_text = body_text.clone();
            async move {
                let client = reqwest::Client::builder()
                    .timeout(timeout)
                    .build()?;
                let mut request = client
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .body(body_text);
                for (name, value) in headers {
                    request = request.header(*name, value.as_str());
                }
                request.send().await
            }
        },
        crate::retry::classify_reqwest_result,
        |attempt| {
            metrics::record_provider_retry(provider, attempt.reason.as_str());
            warn!(
                provider,
                attempt = attempt.attempt,
                reason = attempt.reason.as_str(),
                "provider stream connect retrying"
            );
        },
    )
    .await;

    if ctx.cancel.is_cancelled() {
        return Err(ProviderError::Cancelled);
    }

    let response = result.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Transport(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return match finish_outcome(ctx, status, text, String::new()) {
            Err(e) => Err(e),
            Ok(_) => unreachable!("non-success status cannot produce an outcome"),
        };
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_parse_and_clamp() {
        let mut config = ProviderConfig::default();
        config.extra_options = serde_json::json!({
            "reasoning_effort": "high",
            "service_tier": "flex",
            "thinking_enabled": true,
            "thinking_budget": 100,
            "safety_threshold": "ONLY_HIGH",
            "some_unknown_knob": {"nested": true}
        })
        .as_object()
        .unwrap()
        .clone();

        let options = GenerationOptions::from_config(&config);
        assert_eq!(options.reasoning_effort.as_deref(), Some("high"));
        assert_eq!(options.service_tier.as_deref(), Some("flex"));
        assert!(options.thinking_enabled);
        // Clamped up to the floor.
        assert_eq!(options.thinking_budget, Some(MIN_THINKING_BUDGET));
        assert_eq!(options.safety_threshold.as_deref(), Some("ONLY_HIGH"));
    }

    #[test]
    fn out_of_vocabulary_values_ignored() {
        let mut config = ProviderConfig::default();
        config.extra_options = serde_json::json!({
            "reasoning_effort": "extreme",
            "service_tier": "gold",
            "safety_threshold": "NOPE"
        })
        .as_object()
        .unwrap()
        .clone();

        let options = GenerationOptions::from_config(&config);
        assert_eq!(options.reasoning_effort, None);
        assert_eq!(options.service_tier, None);
        assert_eq!(options.safety_threshold, None);
    }

    #[test]
    fn malformed_tool_schema_replaced() {
        let tool = CustomTool {
            name: "lookup".into(),
            description: "find things".into(),
            parameters: serde_json::json!("not a schema"),
        };
        let params = tool.safe_parameters();
        assert!(params.is_object());
        assert_eq!(params["type"], "object");
    }

    #[test]
    fn timeout_selection() {
        let ctx = CallContext::new(CancellationToken::new(), None, false);
        assert_eq!(ctx.attempt_timeout(false), DEFAULT_TIMEOUT);
        assert_eq!(ctx.attempt_timeout(true), THINKING_TIMEOUT);

        let ctx = CallContext::new(
            CancellationToken::new(),
            Some(Duration::from_secs(10)),
            false,
        );
        assert_eq!(ctx.attempt_timeout(true), Duration::from_secs(10));
    }

    #[test]
    fn sse_parser_reassembles_frames() {
        let mut parser = SseParser::default();
        let events = parser.push(b"event: message_start\ndata: {\"a\":1}\n\nda");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");

        let events = parser.push(b"ta: {\"b\":2}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, None);
        assert_eq!(events[0].data, "{\"b\":2}");
    }

    #[test]
    fn sse_parser_multiline_data() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn model_override_wins() {
        let mut config = ProviderConfig::default();
        config.model = "claude-sonnet-4-5".into();
        let mut params = GenerateParams {
            instructions: String::new(),
            user_input: "hi".into(),
            history: Vec::new(),
            file_store_id: None,
            previous_response_id: None,
            override_model: None,
            enable_web_search: false,
            enable_file_search: false,
            file_id_to_filename: HashMap::new(),
            inline_images: Vec::new(),
            custom_tools: Vec::new(),
            provider_config: config,
            request_id: "r".into(),
            client_id: "c".into(),
        };
        assert_eq!(params.model(), "claude-sonnet-4-5");
        params.override_model = Some("claude-opus-4-5".into());
        assert_eq!(params.model(), "claude-opus-4-5");
        params.override_model = Some(String::new());
        assert_eq!(params.model(), "claude-sonnet-4-5");
    }
}
