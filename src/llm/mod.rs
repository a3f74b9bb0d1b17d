//! Language-model provider abstraction.
//!
//! The orchestrator speaks to models only through [`LlmProvider`], so tests
//! substitute scripted fakes and the wire format stays inside the provider
//! implementation.

pub mod gemini;

pub use gemini::GeminiClient;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::LlmError;

/// One content fragment inside a user message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    /// Raw media bytes, base64-encoded at the wire.
    InlineData { mime: String, data: Vec<u8> },
}

/// A message in the model conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(Vec<MessagePart>),
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// Result of a tool the model requested, fed back as context.
    ToolResult { name: String, result: Value },
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        ChatMessage::User(vec![MessagePart::Text(text.into())])
    }
}

/// A tool surfaced to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// One model turn: free text, tool requests, or both.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    /// A turn with no text and no tool calls carries nothing actionable.
    pub fn is_empty(&self) -> bool {
        self.tool_calls.is_empty()
            && self.text.as_deref().map(str::trim).unwrap_or("").is_empty()
    }
}

/// Chat-completion provider seam.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, LlmError>;
}

/// Text-embedding provider seam, used by memory retrieval.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

/// Call the model with a deadline and a single retry on transient failure.
///
/// A second failure is final; the caller decides how to degrade.
pub async fn chat_with_retry(
    provider: &dyn LlmProvider,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    deadline: Duration,
) -> Result<LlmResponse, LlmError> {
    let first = call_once(provider, messages, tools, deadline).await;
    match first {
        Ok(response) => Ok(response),
        Err(e) if e.is_transient() => {
            warn!("Model call failed, retrying once: {e}");
            call_once(provider, messages, tools, deadline).await
        }
        Err(e) => Err(e),
    }
}

async fn call_once(
    provider: &dyn LlmProvider,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    deadline: Duration,
) -> Result<LlmResponse, LlmError> {
    match tokio::time::timeout(deadline, provider.chat(messages, tools)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout {
            provider: "model".to_string(),
            timeout: deadline,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<LlmResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(LlmError::RateLimited {
                    provider: "fake".into(),
                    retry_after: None,
                });
            }
            Ok(LlmResponse {
                text: Some("ok".into()),
                tool_calls: vec![],
            })
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let provider = FlakyProvider {
            calls: AtomicU32::new(0),
            fail_first: true,
        };
        let response = chat_with_retry(
            &provider,
            &[ChatMessage::user_text("hi")],
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(response.text.as_deref(), Some("ok"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        struct AuthFail(AtomicU32);

        #[async_trait]
        impl LlmProvider for AuthFail {
            async fn chat(
                &self,
                _messages: &[ChatMessage],
                _tools: &[ToolDefinition],
            ) -> Result<LlmResponse, LlmError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::AuthFailed {
                    provider: "fake".into(),
                })
            }
        }

        let provider = AuthFail(AtomicU32::new(0));
        let result = chat_with_retry(
            &provider,
            &[ChatMessage::user_text("hi")],
            &[],
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_response_detection() {
        assert!(LlmResponse::default().is_empty());
        assert!(LlmResponse {
            text: Some("  ".into()),
            tool_calls: vec![]
        }
        .is_empty());
        assert!(!LlmResponse {
            text: Some("hi".into()),
            tool_calls: vec![]
        }
        .is_empty());
    }
}
