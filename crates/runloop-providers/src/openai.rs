use std::collections::HashMap;
use std::str;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use runloop_types::{ModelInfo, ProviderInfo, ToolSchema};

use crate::{
    truncate_for_error, ChatMessage, ChunkStream, Provider, ProviderError, ProviderErrorKind,
    StreamChunk, TokenUsage,
};

/// Chat-completions client for any endpoint speaking the OpenAI SSE dialect.
pub struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(
        id: &str,
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        default_model: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let body = request_body(model, &messages, tools.unwrap_or_default());

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .as_ref()
                .and_then(extract_openai_error)
                .unwrap_or_else(|| truncate_for_error(&text, 500));
            tracing::warn!(model, status = status.as_u16(), "provider rejected chat request");
            return Err(ProviderError::from_status(status.as_u16(), detail).into());
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            let mut calls = ToolCallIndex::default();
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = bytes.next() => Some(next),
                };
                let Some(next) = next else {
                    yield StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    };
                    break;
                };
                let Some(chunk) = next else { break };
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data:") else {
                            continue;
                        };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            for id in calls.drain_open() {
                                yield StreamChunk::ToolCallEnd { id };
                            }
                            continue;
                        }
                        let value = match serde_json::from_str::<Value>(payload) {
                            Ok(value) => value,
                            Err(err) => {
                                tracing::debug!(error = %err, "skipping undecodable stream frame");
                                continue;
                            }
                        };
                        if let Some(detail) = extract_openai_error(&value) {
                            Err::<(), _>(ProviderError::new(ProviderErrorKind::ServerError, detail))?;
                        }
                        for out in calls.translate(&value) {
                            yield out;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Streamed tool-call fragments after the first carry only their `index`;
/// this maps indices back to the ids announced in the first fragment.
#[derive(Default)]
struct ToolCallIndex {
    ids: HashMap<u64, String>,
    open: Vec<String>,
}

impl ToolCallIndex {
    fn translate(&mut self, value: &Value) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        let choices = value
            .get("choices")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for choice in choices {
            let delta = choice.get("delta").cloned().unwrap_or_default();

            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    out.push(StreamChunk::TextDelta(text.to_string()));
                }
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for (position, call) in tool_calls.iter().enumerate() {
                    let index = call
                        .get("index")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(position as u64);
                    let function = call.get("function").cloned().unwrap_or_default();
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
                        let name = function
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        self.ids.insert(index, id.to_string());
                        self.open.push(id.to_string());
                        out.push(StreamChunk::ToolCallStart {
                            id: id.to_string(),
                            name,
                        });
                    }
                    let Some(id) = self.ids.get(&index).cloned() else {
                        continue;
                    };
                    let args_delta = function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    if !args_delta.is_empty() {
                        out.push(StreamChunk::ToolCallDelta {
                            id,
                            args_delta: args_delta.to_string(),
                        });
                    }
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                if !reason.is_empty() {
                    out.extend(self.drain_open().into_iter().map(|id| StreamChunk::ToolCallEnd { id }));
                    out.push(StreamChunk::Done {
                        finish_reason: reason.to_string(),
                        usage: extract_usage(value),
                    });
                }
            }
        }
        out
    }

    fn drain_open(&mut self) -> Vec<String> {
        self.ids.clear();
        std::mem::take(&mut self.open)
    }
}

fn request_body(model: &str, messages: &[ChatMessage], tools: Vec<ToolSchema>) -> Value {
    let wire_messages = messages.iter().map(wire_message).collect::<Vec<_>>();
    let wire_tools = tools
        .into_iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": model,
        "messages": wire_messages,
        "stream": true,
        "stream_options": {"include_usage": true},
    });
    if !wire_tools.is_empty() {
        body["tools"] = Value::Array(wire_tools);
        body["tool_choice"] = json!("auto");
    }
    body
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut wire = json!({"role": message.role, "content": message.content});
    if let Some(call_id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(call_id);
    }
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect();
    }
    wire
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message").or(Some(v)))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
