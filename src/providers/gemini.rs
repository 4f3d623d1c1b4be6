//! Gemini generateContent adapter.
//!
//! Gemini cannot attach its file-search and web-search tools on the same
//! request; when a caller enables both, file search wins and the conflict
//! is logged.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::providers::{
    CallContext, ChatTurn, GenerateParams, GenerateResult, GenerationOptions, Provider,
    ProviderError, SseParser, StreamChunk, STREAM_CHANNEL_CAPACITY, ToolCallRecord, Usage,
    api_key, emit, open_sse_stream, post_json_with_retry, replay_history,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

pub struct GeminiProvider;

impl GeminiProvider {
    fn endpoint(params: &GenerateParams, stream: bool) -> String {
        let base = params
            .provider_config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL);
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}/v1beta/models/{}:{method}",
            base.trim_end_matches('/'),
            params.model()
        )
    }

    fn headers(params: &GenerateParams) -> Result<Vec<(&'static str, String)>, ProviderError> {
        Ok(vec![("x-goog-api-key", api_key(&params.provider_config)?)])
    }

    fn build_body(params: &GenerateParams, options: &GenerationOptions) -> serde_json::Value {
        let replayed = replay_history(&params.history, &params.user_input, true);
        let contents = render_contents(&replayed, params);

        let mut body = json!({ "contents": contents });
        if !params.instructions.is_empty() {
            body["system_instruction"] = json!({"parts": [{"text": params.instructions}]});
        }

        let mut generation = serde_json::Map::new();
        if let Some(t) = params.provider_config.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = params.provider_config.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if let Some(max) = params.provider_config.max_output_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if options.thinking_enabled {
            generation.insert(
                "thinkingConfig".into(),
                json!({
                    "thinkingBudget": options
                        .thinking_budget
                        .unwrap_or(crate::providers::MIN_THINKING_BUDGET),
                    "includeThoughts": options.include_thoughts,
                }),
            );
        }
        if !generation.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation);
        }

        if let Some(threshold) = &options.safety_threshold {
            let mapped = map_safety_threshold(threshold);
            let settings: Vec<serde_json::Value> = SAFETY_CATEGORIES
                .iter()
                .map(|category| json!({"category": category, "threshold": mapped}))
                .collect();
            body["safetySettings"] = json!(settings);
        }

        let mut tools = Vec::new();
        let file_search = params.enable_file_search
            && params
                .file_store_id
                .as_deref()
                .is_some_and(|s| !s.is_empty());
        if file_search && params.enable_web_search {
            warn!("gemini cannot combine file search and web search; using file search");
        }
        if file_search {
            tools.push(json!({
                "file_search": {
                    "file_search_store_names": [params.file_store_id.as_deref().unwrap_or_default()],
                }
            }));
        } else if params.enable_web_search {
            tools.push(json!({"google_search": {}}));
        }
        if !params.custom_tools.is_empty() {
            let declarations: Vec<serde_json::Value> = params
                .custom_tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.safe_parameters(),
                    })
                })
                .collect();
            tools.push(json!({"function_declarations": declarations}));
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        body
    }
}

fn map_safety_threshold(threshold: &str) -> &'static str {
    match threshold {
        "BLOCK_NONE" => "BLOCK_NONE",
        "LOW" => "BLOCK_LOW_AND_ABOVE",
        "MEDIUM" => "BLOCK_MEDIUM_AND_ABOVE",
        "ONLY_HIGH" => "BLOCK_ONLY_HIGH",
        _ => "BLOCK_MEDIUM_AND_ABOVE",
    }
}

fn render_contents(replayed: &[ChatTurn], params: &GenerateParams) -> Vec<serde_json::Value> {
    let last = replayed.len().saturating_sub(1);
    replayed
        .iter()
        .enumerate()
        .map(|(i, turn)| {
            let role = if turn.role == "assistant" { "model" } else { "user" };
            let mut parts = Vec::new();
            if i == last {
                for img in &params.inline_images {
                    parts.push(json!({
                        "inline_data": {
                            "mime_type": img.media_type,
                            "data": img.data_base64,
                        }
                    }));
                }
            }
            parts.push(json!({"text": turn.content}));
            json!({"role": role, "parts": parts})
        })
        .collect()
}

fn parse_usage(value: &serde_json::Value) -> Usage {
    let input = value["promptTokenCount"].as_u64().unwrap_or(0);
    let output = value["candidatesTokenCount"].as_u64().unwrap_or(0);
    Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: value["totalTokenCount"].as_u64().unwrap_or(input + output),
    }
}

/// Collect text and function calls from one response or stream chunk.
fn parse_candidate(
    value: &serde_json::Value,
    text: &mut String,
    tool_calls: &mut Vec<ToolCallRecord>,
) {
    for part in value["candidates"][0]["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
    {
        if let Some(t) = part["text"].as_str() {
            // Thought summaries are flagged; they are not answer text.
            if part["thought"].as_bool() != Some(true) {
                text.push_str(t);
            }
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(ToolCallRecord {
                id: format!("call_{}", tool_calls.len()),
                name: call["name"].as_str().unwrap_or_default().to_string(),
                args: call["args"].clone(),
            });
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }
    fn supports_file_search(&self) -> bool {
        true
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
        let body = Self::build_body(&params, &options);
        let outcome = post_json_with_retry(
            &ctx,
            self.name(),
            ctx.attempt_timeout(options.thinking_enabled),
            &Self::endpoint(&params, false),
            &Self::headers(&params)?,
            &body,
        )
        .await?;

        let parsed: serde_json::Value = serde_json::from_str(&outcome.body)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        parse_candidate(&parsed, &mut text, &mut tool_calls);

        Ok(GenerateResult {
            text,
            response_id: parsed["responseId"].as_str().map(str::to_string),
            usage: parse_usage(&parsed["usageMetadata"]),
            citations: Vec::new(),
            model: parsed["modelVersion"]
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
        let body = Self::build_body(&params, &options);
        let response = open_sse_stream(
            &ctx,
            self.name(),
            ctx.attempt_timeout(options.thinking_enabled),
            &Self::endpoint(&params, true),
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
            let mut saw_finish = false;
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
                    if let Some(error) = data.get("error") {
                        let message = error["message"]
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

                    if let Some(id) = data["responseId"].as_str() {
                        response_id = Some(id.to_string());
                    }
                    if let Some(m) = data["modelVersion"].as_str() {
                        final_model = m.to_string();
                    }
                    if data.get("usageMetadata").is_some() {
                        usage = parse_usage(&data["usageMetadata"]);
                    }

                    let mut delta = String::new();
                    let before_tools = tool_calls.len();
                    parse_candidate(&data, &mut delta, &mut tool_calls);
                    if !delta.is_empty()
                        && !emit(&tx, &cancel, StreamChunk::Text { delta }).await
                    {
                        break 'read;
                    }
                    for record in &tool_calls[before_tools..] {
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

                    if data["candidates"][0]["finishReason"].as_str().is_some() {
                        saw_finish = true;
                    }
                }
            }

            if saw_finish && !completed && !cancel.is_cancelled() {
                let _ = emit(
                    &tx,
                    &cancel,
                    StreamChunk::Complete {
                        response_id,
                        model: final_model,
                        usage,
                        tool_calls: std::mem::take(&mut tool_calls),
                        code_executions: Vec::new(),
                    },
                )
                .await;
            } else if !completed && !cancel.is_cancelled() {
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
            debug!("gemini stream emitter exiting");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::ProviderConfig;
    use std::collections::HashMap;

    fn params_with(enable_file: bool, enable_web: bool) -> GenerateParams {
        let mut config = ProviderConfig::default();
        config.model = "gemini-2.5-pro".into();
        GenerateParams {
            instructions: "be brief".into(),
            user_input: "hello".into(),
            history: Vec::new(),
            file_store_id: Some("store1".into()),
            previous_response_id: None,
            override_model: None,
            enable_web_search: enable_web,
            enable_file_search: enable_file,
            file_id_to_filename: HashMap::new(),
            inline_images: Vec::new(),
            custom_tools: Vec::new(),
            provider_config: config,
            request_id: "r".into(),
            client_id: "c".into(),
        }
    }

    #[test]
    fn file_search_excludes_web_search() {
        let params = params_with(true, true);
        let options = GenerationOptions::default();
        let body = GeminiProvider::build_body(&params, &options);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].get("file_search").is_some());
    }

    #[test]
    fn web_search_alone_is_attached() {
        let params = params_with(false, true);
        let options = GenerationOptions::default();
        let body = GeminiProvider::build_body(&params, &options);
        let tools = body["tools"].as_array().unwrap();
        assert!(tools[0].get("google_search").is_some());
    }

    #[test]
    fn assistant_turns_become_model_role() {
        let mut params = params_with(false, false);
        params.history = vec![ChatTurn::user("q1"), ChatTurn::assistant("a1")];
        let options = GenerationOptions::default();
        let body = GeminiProvider::build_body(&params, &options);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
    }

    #[test]
    fn safety_threshold_mapped_to_all_categories() {
        let mut params = params_with(false, false);
        params.provider_config.extra_options = serde_json::json!({
            "safety_threshold": "ONLY_HIGH"
        })
        .as_object()
        .unwrap()
        .clone();
        let options = GenerationOptions::from_config(&params.provider_config);
        let body = GeminiProvider::build_body(&params, &options);
        let settings = body["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), SAFETY_CATEGORIES.len());
        assert!(settings.iter().all(|s| s["threshold"] == "BLOCK_ONLY_HIGH"));
    }
}
