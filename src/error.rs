//! Error types for Concierge.

use std::time::Duration;

/// Top-level error type for the assistant core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Admission-gate errors. Always user-visible, never retried.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Invite code is invalid or already used")]
    InvalidInvite,

    #[error("Sender {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Database error during admission: {0}")]
    Database(#[from] DatabaseError),
}

/// Ingestion errors. User-visible; the turn aborts before any model cost.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("Empty message")]
    Empty,
}

/// Language-model provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether the error is transient and a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout { .. }
                | LlmError::RequestFailed { .. }
        )
    }
}

/// Tool execution errors as seen by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {0} not found")]
    NotFound(String),

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Tool {name} failed: {reason}")]
    ExecutionFailed { name: String, reason: String },

    #[error("Tool {name} is rate limited")]
    RateLimited { name: String },

    #[error("No linked account for this user")]
    AccountNotLinked,

    #[error("Linked account lacks required scope {0}")]
    InsufficientScope(String),
}

impl ToolError {
    /// Transient errors may be retried for read-only or idempotent tools.
    /// Permanent ones are surfaced to the model as context instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::Timeout { .. } | ToolError::RateLimited { .. }
        )
    }
}

/// Orchestration-loop errors. Reported to the user as a generic failure and
/// logged with the partial tool-call trace.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Model kept requesting tools past {0} iterations")]
    MaxToolIterationsExceeded(u32),

    #[error("Model call failed after retry: {0}")]
    ModelUnavailable(#[source] LlmError),

    #[error("Tool {name} exhausted retries: {reason}")]
    ToolExhausted { name: String, reason: String },

    #[error("Turn cancelled")]
    Cancelled,
}

/// Linked-account credential errors.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("No linked account for user {0}")]
    NotLinked(i64),

    #[error("Linked account lacks scope {0}")]
    MissingScope(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the assistant core.
pub type Result<T> = std::result::Result<T, Error>;
