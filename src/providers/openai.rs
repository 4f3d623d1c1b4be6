//! OpenAI responses-API adapter.
//!
//! The one vendor here with native conversation continuity: when the
//! caller holds a `previous_response_id` only the new user turn is sent.
//! Background responses come back as a handle; the adapter polls until a
//! terminal state.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::providers::{
    CallContext, CodeExecutionRecord, GenerateParams, GenerateResult, GenerationOptions, Provider,
    ProviderError, SseParser, StreamChunk, STREAM_CHANNEL_CAPACITY, ToolCallRecord, Usage,
    api_key, emit, open_sse_stream, post_json_with_retry, replay_history,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Poll cadence for background responses: geometric, doubling per poll.
const POLL_INITIAL: Duration = Duration::from_millis(500);
const POLL_CAP: Duration = Duration::from_secs(5);

/// States in which a background response has finished moving.
const TERMINAL_STATES: &[&str] = &["completed", "failed", "cancelled", "incomplete"];

pub struct OpenAiProvider;

impl OpenAiProvider {
    fn endpoint(params: &GenerateParams) -> String {
        let base = params
            .provider_config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/responses", base.trim_end_matches('/'))
    }

    fn headers(params: &GenerateParams) -> Result<Vec<(&'static str, String)>, ProviderError> {
        Ok(vec![(
            "authorization",
            format!("Bearer {}", api_key(&params.provider_config)?),
        )])
    }

    fn build_body(params: &GenerateParams, options: &GenerationOptions, stream: bool) -> serde_json::Value {
        let model = params.model();
        let input = if params.previous_response_id.is_some() {
            // Native continuity: no replay, just the new turn.
            vec![render_user_turn(&params.user_input, params)]
        } else {
            let replayed = replay_history(&params.history, &params.user_input, false);
            let last = replayed.len().saturating_sub(1);
            replayed
                .iter()
                .enumerate()
                .map(|(i, turn)| {
                    if i == last {
                        render_user_turn(&turn.content, params)
                    } else {
                        json!({"role": turn.role, "content": turn.content})
                    }
                })
                .collect()
        };

        let mut body = json!({
            "model": model,
            "input": input,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if !params.instructions.is_empty() {
            body["instructions"] = json!(params.instructions);
        }
        if let Some(id) = &params.previous_response_id {
            body["previous_response_id"] = json!(id);
        }
        if let Some(t) = params.provider_config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.provider_config.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(max) = params.provider_config.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if let Some(effort) = options.reasoning_effort.as_deref().filter(|e| *e != "none") {
            body["reasoning"] = json!({"effort": effort});
        }
        if let Some(tier) = &options.service_tier {
            body["service_tier"] = json!(tier);
        }
        if let Some(verbosity) = &options.verbosity {
            body["text"] = json!({"verbosity": verbosity});
        }
        if let Some(retention) = &options.prompt_cache_retention {
            // Only the gpt-5 family understands cache retention.
            if model.starts_with("gpt-5") {
                body["prompt_cache_retention"] = json!(retention);
            }
        }

        let mut tools = Vec::new();
        if params.enable_file_search {
            if let Some(store) = params.file_store_id.as_deref().filter(|s| !s.is_empty()) {
                tools.push(json!({"type": "file_search", "vector_store_ids": [store]}));
            }
        }
        if params.enable_web_search {
            tools.push(json!({"type": "web_search"}));
        }
        for tool in &params.custom_tools {
            tools.push(json!({
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.safe_parameters(),
            }));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        body
    }

    /// Poll a background response handle until it reaches a terminal state.
    async fn poll_until_terminal(
        &self,
        ctx: &CallContext,
        params: &GenerateParams,
        response_id: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, ProviderError> {
        let base = params
            .provider_config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{}/v1/responses/{response_id}", base.trim_end_matches('/'));
        let headers = Self::headers(params)?;

        let mut delay = POLL_INITIAL;
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(POLL_CAP);

            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            let mut request = client.get(&url);
            for (name, value) in &headers {
                request = request.header(*name, value.as_str());
            }
            let response = request
                .send()
                .await
                .map_err(|e| ProviderError::Transport(e.to_string()))?;
            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Upstream {
                    status,
                    message,
                    retryable: status >= 500,
                });
            }
            let parsed: serde_json::Value = response
                .json()
                .await
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            let status = parsed["status"].as_str().unwrap_or_default();
            if TERMINAL_STATES.contains(&status) {
                return Ok(parsed);
            }
            debug!(response_id, status, "background response still running");
        }
    }
}

fn render_user_turn(content: &str, params: &GenerateParams) -> serde_json::Value {
    if params.inline_images.is_empty() {
        return json!({"role": "user", "content": content});
    }
    let mut blocks: Vec<serde_json::Value> = params
        .inline_images
        .iter()
        .map(|img| {
            json!({
                "type": "input_image",
                "image_url": format!("data:{};base64,{}", img.media_type, img.data_base64),
            })
        })
        .collect();
    blocks.push(json!({"type": "input_text", "text": content}));
    json!({"role": "user", "content": blocks})
}

fn parse_usage(value: &serde_json::Value) -> Usage {
    let input = value["input_tokens"].as_u64().unwrap_or(0);
    let output = value["output_tokens"].as_u64().unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: value["total_tokens"].as_u64().unwrap_or(input + output),
    }
}

fn parse_output_item(
    item: &serde_json::Value,
    text: &mut String,
    tool_calls: &mut Vec<ToolCallRecord>,
    code_executions: &mut Vec<CodeExecutionRecord>,
) {
    match item["type"].as_str() {
        Some("message") => {
            for part in item["content"].as_array().into_iter().flatten() {
                if part["type"].as_str() == Some("output_text") {
                    text.push_str(part["text"].as_str().unwrap_or_default());
                }
            }
        }
        Some("function_call") => {
            let args = item["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| item["arguments"].clone());
            tool_calls.push(ToolCallRecord {
                id: item["call_id"]
                    .as_str()
                    .or(item["id"].as_str())
                    .unwrap_or_default()
                    .to_string(),
                name: item["name"].as_str().unwrap_or_default().to_string(),
                args,
            });
        }
        Some("code_interpreter_call") => {
            code_executions.push(CodeExecutionRecord {
                id: item["id"].as_str().unwrap_or_default().to_string(),
                code: item["code"].as_str().unwrap_or_default().to_string(),
                output: item["output"].as_str().map(str::to_string),
            });
        }
        _ => {}
    }
}

fn result_from_response(
    parsed: &serde_json::Value,
    fallback_model: &str,
    raw_request: Option<String>,
    raw_response: Option<String>,
) -> Result<GenerateResult, ProviderError> {
    match parsed["status"].as_str() {
        Some("failed") => {
            let message = parsed["error"]["message"]
                .as_str()
                .unwrap_or("response failed")
                .to_string();
            return Err(ProviderError::Upstream {
                status: 502,
                message,
                retryable: true,
            });
        }
        Some("cancelled") => return Err(ProviderError::Cancelled),
        // `completed` and `incomplete` both carry whatever output exists.
        _ => {}
    }

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut code_executions = Vec::new();
    for item in parsed["output"].as_array().into_iter().flatten() {
        parse_output_item(item, &mut text, &mut tool_calls, &mut code_executions);
    }

    Ok(GenerateResult {
        text,
        response_id: parsed["id"].as_str().map(str::to_string),
        usage: parse_usage(&parsed["usage"]),
        citations: Vec::new(),
        model: parsed["model"].as_str().unwrap_or(fallback_model).to_string(),
        tool_calls,
        code_executions,
        raw_request,
        raw_response,
    })
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }
    fn supports_file_search(&self) -> bool {
        true
    }
    fn supports_web_search(&self) -> bool {
        true
    }
    fn supports_native_continuity(&self) -> bool {
        true
    }
    fn supports_streaming(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        ctx: CallContext,
        params: GenerateParams,
    ) -> Result<GenerateResult, ProviderError> {
        let options = GenerationOptions::from_config(&params.provider_config);
        let timeout = ctx.attempt_timeout(options.thinking_enabled);
        let body = Self::build_body(&params, &options, false);
        let outcome = post_json_with_retry(
            &ctx,
            self.name(),
            timeout,
            &Self::endpoint(&params),
            &Self::headers(&params)?,
            &body,
        )
        .await?;

        let mut parsed: serde_json::Value = serde_json::from_str(&outcome.body)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        // Background acceptance: a handle with a non-terminal status.
        let status = parsed["status"].as_str().unwrap_or_default().to_string();
        if !status.is_empty() && !TERMINAL_STATES.contains(&status.as_str()) {
            let id = parsed["id"]
                .as_str()
                .ok_or_else(|| ProviderError::Malformed("background response without id".into()))?
                .to_string();
            parsed = self.poll_until_terminal(&ctx, &params, &id, timeout).await?;
        }

        result_from_response(
            &parsed,
            params.model(),
            outcome.raw_request,
            outcome.raw_response,
        )
    }

    async fn generate_stream(
        &self,
        ctx: CallContext,
        params: GenerateParams,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError> {
        let options = GenerationOptions::from_config(&params.provider_config);
        let body = Self::build_body(&params, &options, true);
        let response = open_sse_stream(
            &ctx,
            self.name(),
            ctx.attempt_timeout(options.thinking_enabled),
            &Self::endpoint(&params),
            &Self::headers(&params)?,
            &body,
        )
        .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let model = params.model().to_string();
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
            let mut code_executions: Vec<CodeExecutionRecord> = Vec::new();
            let mut completed = false;

            'read: loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break 'read,
                    next = stream.next() => next,
                };
                let Some(chunk) = chunk else { break };
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = emit(
                            &tx,
                            &cancel,
                            StreamChunk::Error {
                                message: format!("stream read failed: {e}"),
                                retryable: true,
                            },
                        )
                        .await;
                        completed = true;
                        break;
                    }
                };

                for event in parser.push(&bytes) {
                    if event.data == "[DONE]" {
                        break 'read;
                    }
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                        continue;
                    };
                    let kind = event
                        .event
                        .as_deref()
                        .or(data["type"].as_str())
                        .unwrap_or_default();
                    match kind {
                        "response.output_text.delta" => {
                            let delta = data["delta"].as_str().unwrap_or_default().to_string();
                            if !delta.is_empty()
                                && !emit(&tx, &cancel, StreamChunk::Text { delta }).await
                            {
                                break 'read;
                            }
                        }
                        "response.output_item.done" => {
                            let item = &data["item"];
                            let mut text = String::new();
                            let before_tools = tool_calls.len();
                            let before_code = code_executions.len();
                            parse_output_item(
                                item,
                                &mut text,
                                &mut tool_calls,
                                &mut code_executions,
                            );
                            if tool_calls.len() > before_tools {
                                let record = tool_calls.last().expect("just pushed");
                                if !emit(
                                    &tx,
                                    &cancel,
                                    StreamChunk::ToolCall {
                                        id: record.id.clone(),
                                        name: record.name.clone(),
                                        args: record.args.clone(),
                                    },
                                )
                                .await
                                {
                                    break 'read;
                                }
                            }
                            if code_executions.len() > before_code {
                                let record = code_executions.last().expect("just pushed");
                                if !emit(
                                    &tx,
                                    &cancel,
                                    StreamChunk::CodeExecution {
                                        id: record.id.clone(),
                                        code: record.code.clone(),
                                        output: record.output.clone(),
                                    },
                                )
                                .await
                                {
                                    break 'read;
                                }
                            }
                        }
                        "response.completed" => {
                            let response = &data["response"];
                            let _ = emit(
                                &tx,
                                &cancel,
                                StreamChunk::Complete {
                                    response_id: response["id"].as_str().map(str::to_string),
                                    model: response["model"]
                                        .as_str()
                                        .unwrap_or(&model)
                                        .to_string(),
                                    usage: parse_usage(&response["usage"]),
                                    tool_calls: std::mem::take(&mut tool_calls),
                                    code_executions: std::mem::take(&mut code_executions),
                                },
                            )
                            .await;
                            completed = true;
                            break 'read;
                        }
                        "response.failed" | "error" => {
                            let message = data["response"]["error"]["message"]
                                .as_str()
                                .or(data["message"].as_str())
                                .unwrap_or("provider stream error")
                                .to_string();
                            let _ = emit(
                                &tx,
                                &cancel,
                                StreamChunk::Error {
                                    message,
                                    retryable: false,
                                },
                            )
                            .await;
                            completed = true;
                            break 'read;
                        }
                        _ => {}
                    }
                }
            }

            if !completed && !cancel.is_cancelled() {
                let _ = emit(
                    &tx,
                    &cancel,
                    StreamChunk::Error {
                        message: "stream ended without completion".into(),
                        retryable: true,
                    },
                )
                .await;
            }
            debug!("openai stream emitter exiting");
        });

        Ok(rx)
    }
}
