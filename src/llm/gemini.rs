//! Gemini REST client for chat completion and text embedding.
//!
//! Uses the `generateContent` and `embedContent` endpoints directly. The API
//! key travels in the `x-goog-api-key` header, never in the URL.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::config::ModelConfig;
use crate::error::LlmError;
use crate::llm::{
    ChatMessage, EmbeddingProvider, LlmProvider, LlmResponse, MessagePart, ToolCall,
    ToolDefinition,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER: &str = "gemini";

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    embedding_model: String,
}

impl GeminiClient {
    pub fn new(config: &ModelConfig) -> Self {
        Self::with_base_url(config, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(config: &ModelConfig, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        }
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, LlmError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: PROVIDER.to_string(),
                        timeout: Duration::ZERO,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: PROVIDER.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error: {text}");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                },
                _ => LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("status {status}: {text}"),
                },
            });
        }

        response.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("response body was not JSON: {e}"),
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError> {
        let body = build_generate_body(messages, tools);
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        debug!(model = %self.model, tools = tools.len(), "Calling Gemini generateContent");
        let data = self.post(&url, &body).await?;
        parse_generate_response(&data)
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let url = format!(
            "{}/models/{}:embedContent",
            self.base_url, self.embedding_model
        );
        let body = json!({
            "content": { "parts": [{ "text": text }] }
        });
        let data = self.post(&url, &body).await?;

        let values = data
            .pointer("/embedding/values")
            .and_then(Value::as_array)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "missing embedding values".to_string(),
            })?;
        Ok(values
            .iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect())
    }
}

/// Build the `generateContent` request body: typed messages become Gemini
/// `contents` plus a top-level `system_instruction`.
fn build_generate_body(messages: &[ChatMessage], tools: &[ToolDefinition]) -> Value {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for message in messages {
        match message {
            ChatMessage::System(text) => {
                system_parts.push(json!({ "text": text }));
            }
            ChatMessage::User(parts) => {
                let parts: Vec<Value> = parts.iter().map(part_to_json).collect();
                contents.push(json!({ "role": "user", "parts": parts }));
            }
            ChatMessage::Assistant { text, tool_calls } => {
                let mut parts = Vec::new();
                if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                    parts.push(json!({ "text": text }));
                }
                for call in tool_calls {
                    parts.push(json!({
                        "functionCall": { "name": call.name, "args": call.arguments }
                    }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            ChatMessage::ToolResult { name, result } => {
                // functionResponse.response maps to a protobuf Struct, which
                // must be a JSON object, never an array or primitive.
                let response = match result {
                    Value::Object(_) => result.clone(),
                    other => json!({ "result": other }),
                };
                contents.push(json!({
                    "role": "function",
                    "parts": [{
                        "functionResponse": { "name": name, "response": response }
                    }]
                }));
            }
        }
    }

    let mut body = json!({ "contents": contents });
    if !system_parts.is_empty() {
        body["system_instruction"] = json!({ "parts": system_parts });
    }
    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut params = tool.parameters.clone();
                strip_unsupported_fields(&mut params);
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": params
                })
            })
            .collect();
        body["tools"] = json!([{ "function_declarations": declarations }]);
    }
    body
}

fn part_to_json(part: &MessagePart) -> Value {
    match part {
        MessagePart::Text(text) => json!({ "text": text }),
        MessagePart::InlineData { mime, data } => json!({
            "inline_data": { "mime_type": mime, "data": BASE64.encode(data) }
        }),
    }
}

/// Gemini rejects `$schema` and `additionalProperties` in function parameter
/// schemas; strip them recursively.
fn strip_unsupported_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("$schema");
            map.remove("additionalProperties");
            for v in map.values_mut() {
                strip_unsupported_fields(v);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                strip_unsupported_fields(v);
            }
        }
        _ => {}
    }
}

/// Parse a `generateContent` response into text and tool calls.
fn parse_generate_response(data: &Value) -> Result<LlmResponse, LlmError> {
    let Some(candidate) = data.pointer("/candidates/0") else {
        let block_reason = data
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("no candidates returned");
        return Err(LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: block_reason.to_string(),
        });
    };

    let empty = Vec::new();
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: "functionCall without a name".to_string(),
                })?;
            tool_calls.push(ToolCall {
                name: name.trim().to_string(),
                arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }

    Ok(LlmResponse {
        text: if text.is_empty() { None } else { Some(text) },
        tool_calls,
    })
}
