//! Mail tools over the linked workspace account.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::accounts::LinkedAccounts;
use crate::error::ToolError;
use crate::tools::gateway::{MailDraft, WorkspaceClient, resolve_credential, scopes};
use crate::tools::tool::{Idempotency, Tool, ToolContext, optional_str, optional_u64, require_str};

const DEFAULT_LIST_LIMIT: u64 = 10;
const MAX_LIST_LIMIT: u64 = 25;

/// List recent messages, optionally filtered by a search query.
pub struct ListMailTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl ListMailTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for ListMailTool {
    fn name(&self) -> &str {
        "list_mail"
    }

    fn description(&self) -> &str {
        "List the user's recent email messages. Supports an optional search \
         query (sender, subject keywords) and a result limit."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Optional search query, e.g. 'from:alice subject:invoice'"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of messages to return (default 10)"
                }
            }
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::ReadOnly
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::MAIL_READ)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::MAIL_READ, self.name()).await?;
        let query = optional_str(&args, "query");
        let limit = optional_u64(&args, "limit", DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT) as usize;

        let messages = self.workspace.list_messages(&cred, query, limit).await?;
        Ok(json!({ "count": messages.len(), "messages": messages }))
    }
}

/// Send an email from the user's account. Not retried automatically: a
/// timeout after dispatch could mean the message went out.
pub struct SendMailTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl SendMailTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for SendMailTool {
    fn name(&self) -> &str {
        "send_mail"
    }

    fn description(&self) -> &str {
        "Send a plain-text email from the user's account. Requires recipient, \
         subject and body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Recipient email address" },
                "subject": { "type": "string" },
                "body": { "type": "string", "description": "Plain-text message body" }
            },
            "required": ["to", "subject", "body"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::NonIdempotentWrite
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::MAIL_SEND)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let draft = MailDraft {
            to: require_str(&args, "to", self.name())?.to_string(),
            subject: require_str(&args, "subject", self.name())?.to_string(),
            body: require_str(&args, "body", self.name())?.to_string(),
        };
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::MAIL_SEND, self.name()).await?;

        let message_id = self.workspace.send_message(&cred, &draft).await?;
        info!(user_id = ctx.user_id, to = %draft.to, "Mail sent");
        Ok(json!({ "status": "sent", "message_id": message_id }))
    }
}
