//! Tool abstraction for agent capabilities.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;

/// Retry classification for a tool.
///
/// Only read-only and idempotent tools may be re-run automatically after a
/// transient failure. A non-idempotent write that times out is ambiguous (it
/// may have landed), so the outcome is reported instead of retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    ReadOnly,
    IdempotentWrite,
    NonIdempotentWrite,
}

impl Idempotency {
    pub fn retryable(&self) -> bool {
        matches!(self, Idempotency::ReadOnly | Idempotency::IdempotentWrite)
    }
}

/// Per-call context handed to every tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The admitted user this call runs on behalf of.
    pub user_id: i64,
}

/// A capability exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema object describing the arguments.
    fn parameters_schema(&self) -> Value;

    fn idempotency(&self) -> Idempotency;

    /// Delegated-authorization scope this tool needs, if any.
    fn required_scope(&self) -> Option<&str> {
        None
    }

    /// Execute with model-supplied arguments. The result is serialized back
    /// to the model verbatim.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Pull a required string argument out of model-supplied JSON.
pub fn require_str<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required string argument '{key}'"),
        })
}

/// Optional string argument; absent and null both read as `None`.
pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

/// Optional positive integer argument with a default.
pub fn optional_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key)
        .and_then(Value::as_u64)
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
