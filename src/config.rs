//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Core pipeline configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Maximum model-call/tool-dispatch iterations per turn.
    pub max_tool_iterations: u32,
    /// Inbound attachment size limit in bytes.
    pub max_attachment_bytes: usize,
    /// Number of memory records retrieved per turn.
    pub memory_top_k: usize,
    /// Minimum cosine similarity for a memory record to be used.
    pub memory_min_similarity: f32,
    /// Memory records older than this are excluded from retrieval.
    pub memory_max_age_days: i64,
    /// Recent transcript turns replayed to the model.
    pub history_window: usize,
    /// Voice replies are only synthesized under this many words.
    pub voice_max_words: usize,
    /// Timeout for a single model call.
    pub model_timeout: Duration,
    /// Timeout for a single tool invocation.
    pub tool_timeout: Duration,
    /// Timeout for memory retrieval; on expiry the turn proceeds without it.
    pub memory_timeout: Duration,
    /// Timeout for speech synthesis; on expiry the reply falls back to text.
    pub synthesis_timeout: Duration,
    /// Retry budget for read-only or idempotent tool calls.
    pub tool_retries: u32,
    /// Extracted web content is truncated to this many bytes.
    pub url_content_limit: usize,
    /// System instructions prepended to every model request.
    pub system_prompt: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: 15,
            max_attachment_bytes: 20 * 1024 * 1024, // 20 MB
            memory_top_k: 5,
            memory_min_similarity: 0.25,
            memory_max_age_days: 90,
            history_window: 20,
            voice_max_words: 30,
            model_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(30),
            memory_timeout: Duration::from_secs(5),
            synthesis_timeout: Duration::from_secs(30),
            tool_retries: 2,
            url_content_limit: 6000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Default system instructions for the assistant.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a helpful assistant in a chat. Be concise. Reply in plain text, \
not markdown, and only use line breaks when necessary.

You have tools for the user's mail, calendar, files, spreadsheets and \
meetings. When the user asks about their account, use the tools to get real \
data instead of guessing. If a tool returns an error, do not immediately \
retry the same tool with the same arguments; tell the user what failed and \
suggest an alternative. Complete tasks in as few steps as possible.";

/// Language-model endpoint configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: SecretString,
    pub model: String,
    pub embedding_model: String,
}

impl ModelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".into()))?;
        Ok(Self {
            api_key: SecretString::from(api_key),
            model: env_or("CONCIERGE_MODEL", "gemini-2.0-flash"),
            embedding_model: env_or("CONCIERGE_EMBEDDING_MODEL", "text-embedding-004"),
        })
    }
}

/// Delegated-authorization client configuration for the linked account.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_endpoint: String,
}

impl OAuthConfig {
    /// Returns `None` when the linked-account feature is not configured.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("WORKSPACE_CLIENT_ID").ok()?;
        let client_secret = std::env::var("WORKSPACE_CLIENT_SECRET").ok()?;
        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            token_endpoint: env_or(
                "WORKSPACE_TOKEN_ENDPOINT",
                "https://oauth2.googleapis.com/token",
            ),
        })
    }
}

/// Speech-synthesis configuration.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub api_key: SecretString,
    pub voice_id: String,
}

impl VoiceConfig {
    /// Returns `None` when voice replies are not configured.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("ELEVENLABS_API_KEY").ok()?;
        Some(Self {
            api_key: SecretString::from(api_key),
            voice_id: env_or("ELEVENLABS_VOICE_ID", "21m00Tcm4TlvDq8ikWAM"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
