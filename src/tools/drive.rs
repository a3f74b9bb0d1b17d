//! File-search tool over the linked workspace account.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::accounts::LinkedAccounts;
use crate::error::ToolError;
use crate::tools::gateway::{WorkspaceClient, resolve_credential, scopes};
use crate::tools::tool::{Idempotency, Tool, ToolContext, optional_u64, require_str};

const DEFAULT_LIMIT: u64 = 10;
const MAX_LIMIT: u64 = 25;

/// Search the user's cloud files by name.
pub struct SearchFilesTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl SearchFilesTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search the user's cloud storage for files by name. Returns file \
         names, types and links."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "File name or part of it" },
                "limit": { "type": "integer", "description": "Maximum results (default 10)" }
            },
            "required": ["query"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::ReadOnly
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::DRIVE_READ)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = require_str(&args, "query", self.name())?;
        let limit = optional_u64(&args, "limit", DEFAULT_LIMIT).min(MAX_LIMIT) as usize;
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::DRIVE_READ, self.name())
                .await?;

        let files = self.workspace.search_files(&cred, query, limit).await?;
        Ok(json!({ "count": files.len(), "files": files }))
    }
}
