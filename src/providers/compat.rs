//! Adapter for OpenAI-compatible chat-completions vendors.
//!
//! Anything that speaks `POST /chat/completions` can be configured under
//! an arbitrary provider name with a `base_url`; this adapter covers all
//! of them. No file search, no web search, no native continuity.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use crate::providers::{
    CallContext, GenerateParams, GenerateResult, GenerationOptions, Provider, ProviderError,
    SseParser, StreamChunk, STREAM_CHANNEL_CAPACITY, ToolCallRecord, Usage, api_key, emit,
    open_sse_stream, post_json_with_retry, replay_history,
};

pub struct CompatProvider {
    name: String,
}

impl CompatProvider {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    fn endpoint(&self, params: &GenerateParams) -> Result<String, ProviderError> {
        let base = params
            .provider_config
            .base_url
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!(
                    "provider {:?} requires a base_url",
                    self.name
                ))
            })?;
        Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
    }

    fn headers(params: &GenerateParams) -> Vec<(&'static str, String)> {
        // Some compatible vendors (local runtimes) take no key at all.
        match api_key(&params.provider_config) {
            Ok(key) => vec![("authorization", format!("Bearer {key}"))],
            Err(_) => Vec::new(),
        }
    }

    fn build_body(params: &GenerateParams, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if !params.instructions.is_empty() {
            messages.push(json!({"role": "system", "content": params.instructions}));
        }
        for turn in replay_history(&params.history, &params.user_input, false) {
            messages.push(json!({"role": turn.role, "content": turn.content}));
        }

        let mut body = json!({
            "model": params.model(),
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(t) = params.provider_config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.provider_config.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(max) = params.provider_config.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if !params.custom_tools.is_empty() {
            let tools: Vec<serde_json::Value> = params
                .custom_tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.safe_parameters(),
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

fn parse_usage(value: &serde_json::Value) -> Usage {
    let input = value["prompt_tokens"].as_u64().unwrap_or(0);
    let output = value["completion_tokens"].as_u64().unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: value["total_tokens"].as_u64().unwrap_or(input + output),
    }
}

fn parse_tool_calls(value: &serde_json::Value) -> Vec<ToolCallRecord> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .map(|call| {
            let args = call["function"]["arguments"]
                .as_str()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| call["function"]["arguments"].clone());
            ToolCallRecord {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                args,
            }
        })
        .collect()
}

#[async_trait]
impl Provider for CompatProvider {
    fn name(&self) -> &str {
        &self.name
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
        ctx: CallContext,
        params: GenerateParams,
    ) -> Result<GenerateResult, ProviderError> {
        let options = GenerationOptions::from_config(&params.provider_config);
        let body = Self::build_body(&params, false);
        let outcome = post_json_with_retry(
            &ctx,
            self.name(),
            ctx.attempt_timeout(options.thinking_enabled),
            &self.endpoint(&params)?,
            &Self::headers(&params),
            &body,
        )
        .await?;

        let parsed: serde_json::Value = serde_json::from_str(&outcome.body)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let message = &parsed["choices"][0]["message"];
        Ok(GenerateResult {
            text: message["content"].as_str().unwrap_or_default().to_string(),
            response_id: parsed["id"].as_str().map(str::to_string),
            usage: parse_usage(&parsed["usage"]),
            citations: Vec::new(),
            model: parsed["model"].as_str().unwrap_or(params.model()).to_string(),
            tool_calls: parse_tool_calls(&message["tool_calls"]),
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
        let body = Self::build_body(&params, true);
        let response = open_sse_stream(
            &ctx,
            self.name(),
            ctx.attempt_timeout(options.thinking_enabled),
            &self.endpoint(&params)?,
            &Self::headers(&params),
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
            // Streaming tool calls arrive as argument fragments by index.
            let mut partial_tools: Vec<(String, String, String)> = Vec::new();
            let mut finished = false;
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
                    if let Some(id) = data["id"].as_str() {
                        response_id = Some(id.to_string());
                    }
                    if let Some(m) = data["model"].as_str() {
                        final_model = m.to_string();
                    }
                    if data.get("usage").is_some() && !data["usage"].is_null() {
                        usage = parse_usage(&data["usage"]);
                    }

                    let choice = &data["choices"][0];
                    if let Some(delta) = choice["delta"]["content"].as_str() {
                        if !delta.is_empty()
                            && !emit(
                                &tx,
                                &cancel,
                                StreamChunk::Text {
                                    delta: delta.to_string(),
                                },
                            )
                            .await
                        {
                            break 'read;
                        }
                    }
                    for call in choice["delta"]["tool_calls"].as_array().into_iter().flatten() {
                        let index = call["index"].as_u64().unwrap_or(0) as usize;
                        while partial_tools.len() <= index {
                            partial_tools.push((String::new(), String::new(), String::new()));
                        }
                        let slot = &mut partial_tools[index];
                        if let Some(id) = call["id"].as_str() {
                            slot.0 = id.to_string();
                        }
                        if let Some(name) = call["function"]["name"].as_str() {
                            slot.1.push_str(name);
                        }
                        if let Some(args) = call["function"]["arguments"].as_str() {
                            slot.2.push_str(args);
                        }
                    }
                    if choice["finish_reason"].as_str().is_some() {
                        finished = true;
                    }
                }
            }

            let tool_calls: Vec<ToolCallRecord> = partial_tools
                .into_iter()
                .filter(|(_, name, _)| !name.is_empty())
                .map(|(id, name, args)| ToolCallRecord {
                    id,
                    name,
                    args: serde_json::from_str(&args)
                        .unwrap_or(serde_json::Value::Object(Default::default())),
                })
                .collect();

            if !completed && !cancel.is_cancelled() {
                if finished {
                    for record in &tool_calls {
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
                            break;
                        }
                    }
                    let _ = emit(
                        &tx,
                        &cancel,
                        StreamChunk::Complete {
                            response_id,
                            model: final_model,
                            usage,
                            tool_calls,
                            code_executions: Vec::new(),
                        },
                    )
                    .await;
                } else {
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
            }
            debug!(provider = "compat", "stream emitter exiting");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::ProviderConfig;
    use std::collections::HashMap;

    fn params(base_url: Option<&str>) -> GenerateParams {
        let mut config = ProviderConfig::default();
        config.model = "llama-3.3-70b".into();
        config.base_url = base_url.map(str::to_string);
        GenerateParams {
            instructions: "sys".into(),
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
        }
    }

    #[test]
    fn requires_base_url() {
        let provider = CompatProvider::new("groq");
        assert!(provider.endpoint(&params(None)).is_err());
        assert_eq!(
            provider
                .endpoint(&params(Some("https://api.groq.com/openai/v1/")))
                .unwrap(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn system_message_leads() {
        let body = CompatProvider::build_body(&params(Some("http://localhost:11434/v1")), false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages.last().unwrap()["role"], "user");
    }

    #[test]
    fn streaming_requests_usage() {
        let body = CompatProvider::build_body(&params(Some("http://localhost:11434/v1")), true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }
}
