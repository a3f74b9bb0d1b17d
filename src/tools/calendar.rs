//! Calendar and meeting tools over the linked workspace account.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::accounts::LinkedAccounts;
use crate::error::ToolError;
use crate::tools::gateway::{EventDraft, WorkspaceClient, resolve_credential, scopes};
use crate::tools::tool::{Idempotency, Tool, ToolContext, optional_str, require_str};

fn attendees_from(args: &Value) -> Vec<String> {
    args.get("attendees")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// List events in a time window.
pub struct ListEventsTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl ListEventsTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for ListEventsTool {
    fn name(&self) -> &str {
        "list_events"
    }

    fn description(&self) -> &str {
        "List the user's calendar events between two RFC 3339 timestamps."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "time_min": {
                    "type": "string",
                    "description": "Window start, RFC 3339, e.g. 2026-08-29T00:00:00Z"
                },
                "time_max": {
                    "type": "string",
                    "description": "Window end, RFC 3339"
                }
            },
            "required": ["time_min", "time_max"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::ReadOnly
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::CALENDAR)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let time_min = require_str(&args, "time_min", self.name())?;
        let time_max = require_str(&args, "time_max", self.name())?;
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::CALENDAR, self.name()).await?;

        let events = self.workspace.list_events(&cred, time_min, time_max).await?;
        Ok(json!({ "count": events.len(), "events": events }))
    }
}

/// Create a calendar event. Never auto-retried: a timeout may have created
/// the event anyway.
pub struct CreateEventTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl CreateEventTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &str {
        "create_event"
    }

    fn description(&self) -> &str {
        "Create a calendar event with a title, start and end time, and \
         optional attendees and description."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "start": { "type": "string", "description": "RFC 3339 start time" },
                "end": { "type": "string", "description": "RFC 3339 end time" },
                "attendees": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Attendee email addresses"
                },
                "description": { "type": "string" }
            },
            "required": ["title", "start", "end"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::NonIdempotentWrite
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::CALENDAR)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let draft = EventDraft {
            title: require_str(&args, "title", self.name())?.to_string(),
            start: require_str(&args, "start", self.name())?.to_string(),
            end: require_str(&args, "end", self.name())?.to_string(),
            attendees: attendees_from(&args),
            description: optional_str(&args, "description").map(str::to_string),
            with_video_link: false,
        };
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::CALENDAR, self.name()).await?;

        let event = self.workspace.create_event(&cred, &draft).await?;
        info!(user_id = ctx.user_id, event_id = %event.id, "Event created");
        Ok(json!({ "status": "created", "event": event }))
    }
}

/// Schedule a meeting: a calendar event carrying a video-conference link.
pub struct ScheduleMeetingTool {
    accounts: Arc<LinkedAccounts>,
    workspace: Arc<dyn WorkspaceClient>,
}

impl ScheduleMeetingTool {
    pub fn new(accounts: Arc<LinkedAccounts>, workspace: Arc<dyn WorkspaceClient>) -> Self {
        Self {
            accounts,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for ScheduleMeetingTool {
    fn name(&self) -> &str {
        "schedule_meeting"
    }

    fn description(&self) -> &str {
        "Schedule a meeting with attendees. Creates a calendar event and \
         attaches a video-conference link, which is returned in the result."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "start": { "type": "string", "description": "RFC 3339 start time" },
                "end": { "type": "string", "description": "RFC 3339 end time" },
                "attendees": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Attendee email addresses"
                },
                "description": { "type": "string" }
            },
            "required": ["title", "start", "end", "attendees"]
        })
    }

    fn idempotency(&self) -> Idempotency {
        Idempotency::NonIdempotentWrite
    }

    fn required_scope(&self) -> Option<&str> {
        Some(scopes::CALENDAR)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let attendees = attendees_from(&args);
        if attendees.is_empty() {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "a meeting needs at least one attendee".to_string(),
            });
        }
        let draft = EventDraft {
            title: require_str(&args, "title", self.name())?.to_string(),
            start: require_str(&args, "start", self.name())?.to_string(),
            end: require_str(&args, "end", self.name())?.to_string(),
            attendees,
            description: optional_str(&args, "description").map(str::to_string),
            with_video_link: true,
        };
        let cred =
            resolve_credential(&self.accounts, ctx.user_id, scopes::CALENDAR, self.name()).await?;

        let event = self.workspace.create_event(&cred, &draft).await?;
        info!(user_id = ctx.user_id, event_id = %event.id, "Meeting scheduled");
        Ok(json!({
            "status": "scheduled",
            "video_link": event.video_link,
            "event": event
        }))
    }
}
