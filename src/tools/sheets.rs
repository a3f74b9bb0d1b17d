//! Spreadsheet tools over the linked workspace account.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::accounts::LinkedAccounts;
use crate::error::ToolError;
use crate::tools::gateway::{WorkspaceClient, resolve_credential, scopes};
use crate::tools::tool::{Idempotency, Tool, ToolContext, require_str};

/// Read a cell range from a spreadsheet.
pub struct ReadSheetTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl ReadSheetTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for ReadSheetTool {
    fn name(&self) -> &str {
        "read_sheet"
    }

    fn description(&self) -> &str {
        "Read a cell range from one of the user's spreadsheets. Returns rows \
         of cell values."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "spreadsheet_id": { "type": "string" },
                "range": {
                    "type": "string",
                    "description": "A1-notation range, e.g. 'Sheet1!A1:D20'"
                }
            },
            "required": ["spreadsheet_id", "range"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::ReadOnly
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::SHEETS)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let spreadsheet_id = require_str(&args, "spreadsheet_id", self.name())?;
        let range = require_str(&args, "range", self.name())?;
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::SHEETS, self.name()).await?;

        let data = self.workspace.read_sheet(&cred, spreadsheet_id, range).await?;
        Ok(json!({ "range": data.range, "rows": data.rows }))
    }
}

/// Append a row to a spreadsheet. The append position depends on current
/// content, so a repeat after an ambiguous timeout could duplicate the row.
pub struct AppendSheetRowTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl AppendSheetRowTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for AppendSheetRowTool {
    fn name(&self) -> &str {
        "append_sheet_row"
    }

    fn description(&self) -> &str {
        "Append one row of values to the end of a spreadsheet range."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "spreadsheet_id": { "type": "string" },
                "range": {
                    "type": "string",
                    "description": "A1-notation range the table lives in, e.g. 'Sheet1!A:D'"
                },
                "values": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Cell values for the new row, left to right"
                }
            },
            "required": ["spreadsheet_id", "range", "values"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::NonIdempotentWrite
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::SHEETS)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let spreadsheet_id = require_str(&args, "spreadsheet_id", self.name())?;
        let range = require_str(&args, "range", self.name())?;
        let values: Vec<String> = args
            .get("values")
            .and_then(Value::as_array)
            .map(|v| {
                v.iter()
                    .map(|cell| match cell {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .filter(|v: &Vec<String>| !v.is_empty())
            .ok_or_else(|| ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "missing non-empty 'values' array".to_string(),
            })?;
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::SHEETS, self.name()).await?;

        self.workspace
            .append_sheet_row(&cred, spreadsheet_id, range, &values)
            .await?;
        info!(user_id = ctx.user_id, spreadsheet_id, "Sheet row appended");
        Ok(json!({ "status": "appended", "cells": values.len() }))
    }
}
