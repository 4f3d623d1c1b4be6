//! Anthropic messages-API adapter.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::providers::{
    CallContext, ChatTurn, GenerateParams, GenerateResult, GenerationOptions, Provider,
    ProviderError, SseParser, StreamChunk, STREAM_CHANNEL_CAPACITY, ToolCallRecord, Usage,
    api_key, emit, open_sse_stream, post_json_with_retry, replay_history,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Max output ceiling when the tenant sets none; thinking needs headroom
/// for the thinking blocks plus the visible reply.
const DEFAULT_MAX_TOKENS: u32 = 4096;
const THINKING_MAX_TOKENS: u32 = 16_384;

pub struct AnthropicProvider;

impl AnthropicProvider {
    fn build_body(params: &GenerateParams, options: &GenerationOptions, stream: bool) -> serde_json::Value {
        let replayed = replay_history(&params.history, &params.user_input, true);
        let messages = render_messages(&replayed, params);

        let max_tokens = params.provider_config.max_output_tokens.unwrap_or(if options.thinking_enabled {
            THINKING_MAX_TOKENS
        } else {
            DEFAULT_MAX_TOKENS
        });

        let mut body = json!({
            "model": params.model(),
            "max_tokens": max_tokens,
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if !params.instructions.is_empty() {
            body["system"] = json!(params.instructions);
        }
        if let Some(t) = params.provider_config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.provider_config.top_p {
            body["top_p"] = json!(p);
        }
        if options.thinking_enabled {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": options.thinking_budget.unwrap_or(crate::providers::MIN_THINKING_BUDGET),
            });
        }

        let mut tools = Vec::new();
        if params.enable_web_search {
            tools.push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
            }));
        }
        for tool in &params.custom_tools {
            tools.push(json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.safe_parameters(),
            }));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        body
    }

    fn endpoint(params: &GenerateParams) -> String {
        let base = params
            .provider_config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }

    fn headers(params: &GenerateParams) -> Result<Vec<(&'static str, String)>, ProviderError> {
        Ok(vec![
            ("x-api-key", api_key(&params.provider_config)?),
            ("anthropic-version", API_VERSION.to_string()),
        ])
    }
}

/// Render replayed turns; the final user turn carries inline images as a
/// content-block array when any are attached.
fn render_messages(replayed: &[ChatTurn], params: &GenerateParams) -> Vec<serde_json::Value> {
    let last = replayed.len().saturating_sub(1);
    replayed
        .iter()
        .enumerate()
        .map(|(i, turn)| {
            if i == last && !params.inline_images.is_empty() {
                let mut blocks: Vec<serde_json::Value> = params
                    .inline_images
                    .iter()
                    .map(|img| {
                        json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": img.media_type,
                                "data": img.data_base64,
                            }
                        })
                    })
                    .collect();
                blocks.push(json!({"type": "text", "text": turn.content}));
                json!({"role": turn.role, "content": blocks})
            } else {
                json!({"role": turn.role, "content": turn.content})
            }
        })
        .collect()
}

fn parse_usage(value: &serde_json::Value) -> Usage {
    let input = value["input_tokens"].as_u64().unwrap_or(0);
    let output = value["output_tokens"].as_u64().unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn supports_file_search(&self) -> bool {
        false
    }
    fn supports_web_search(&self) -> bool {
        true
    }
    fn supports_native_continuity(&self) -> bool {
        false
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
        let body = Self::build_body(&params, &options, false);
        let outcome = post_json_with_retry(
            &ctx,
            self.name(),
            ctx.attempt_timeout(options.thinking_enabled),
            &Self::endpoint(&params),
            &Self::headers(&params)?,
            &body,
        )
        .await?;

        let parsed: serde_json::Value = serde_json::from_str(&outcome.body)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(ToolCallRecord {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    args: block["input"].clone(),
                }),
                _ => {}
            }
        }

        Ok(GenerateResult {
            text,
            response_id: parsed["id"].as_str().map(str::to_string),
            usage: parse_usage(&parsed["usage"]),
            citations: Vec::new(),
            model: parsed["model"]
                .as_str()
                .unwrap_or(params.model())
                .to_string(),
            tool_calls,
            code_executions: Vec::new(),
            raw_request: outcome.raw_request,
            raw_response: outcome.raw_response,
        })
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
            let mut usage = Usage::default();
            let mut response_id = None;
            let mut final_model = model;
            let mut tool_calls: Vec<ToolCallRecord> = Vec::new();
            // One tool_use block streams its args as JSON fragments.
            let mut open_tool: Option<(String, String, String)> = None;
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
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&event.data) else {
                        continue;
                    };
                    match event.event.as_deref().unwrap_or_default() {
                        "message_start" => {
                            let message = &data["message"];
                            response_id = message["id"].as_str().map(str::to_string);
                            if let Some(m) = message["model"].as_str() {
                                final_model = m.to_string();
                            }
                            usage = parse_usage(&message["usage"]);
                        }
                        "content_block_start" => {
                            let block = &data["content_block"];
                            if block["type"].as_str() == Some("tool_use") {
                                open_tool = Some((
                                    block["id"].as_str().unwrap_or_default().to_string(),
                                    block["name"].as_str().unwrap_or_default().to_string(),
                                    String::new(),
                                ));
                            }
                        }
                        "content_block_delta" => match data["delta"]["type"].as_str() {
                            Some("text_delta") => {
                                let delta =
                                    data["delta"]["text"].as_str().unwrap_or_default().to_string();
                                if !delta.is_empty()
                                    && !emit(&tx, &cancel, StreamChunk::Text { delta }).await
                                {
                                    break 'read;
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some((_, _, args)) = open_tool.as_mut() {
                                    args.push_str(
                                        data["delta"]["partial_json"].as_str().unwrap_or_default(),
                                    );
                                }
                            }
                            _ => {}
                        },
                        "content_block_stop" => {
                            if let Some((id, name, args)) = open_tool.take() {
                                let args = serde_json::from_str(&args)
                                    .unwrap_or(serde_json::Value::Object(Default::default()));
                                let record = ToolCallRecord {
                                    id: id.clone(),
                                    name: name.clone(),
                                    args: args.clone(),
                                };
                                tool_calls.push(record);
                                if !emit(&tx, &cancel, StreamChunk::ToolCall { id, name, args })
                                    .await
                                {
                                    break 'read;
                                }
                            }
                        }
                        "message_delta" => {
                            let delta_usage = &data["usage"];
                            if let Some(out) = delta_usage["output_tokens"].as_u64() {
                                usage.output_tokens = out;
                                usage.total_tokens = usage.input_tokens + out;
                            }
                        }
                        "message_stop" => {
                            let _ = emit(
                                &tx,
                                &cancel,
                                StreamChunk::Complete {
                                    response_id: response_id.clone(),
                                    model: final_model.clone(),
                                    usage,
                                    tool_calls: std::mem::take(&mut tool_calls),
                                    code_executions: Vec::new(),
                                },
                            )
                            .await;
                            completed = true;
                            break 'read;
                        }
                        "error" => {
                            let message = data["error"]["message"]
                                .as_str()
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
                // Upstream closed without a terminal frame.
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
            debug!("anthropic stream emitter exiting");
            // Dropping tx closes the channel.
        });

        Ok(rx)
    }
}
