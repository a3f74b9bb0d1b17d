//! Workspace gateway — one normalized client over the provider's mail,
//! calendar, file, and spreadsheet APIs.
//!
//! Tool adapters speak these normalized types only; vendor response shapes
//! never cross this boundary. Tests substitute the whole trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::accounts::{AccessCredential, LinkedAccounts};
use crate::error::{AccountError, ToolError};

/// Delegated-authorization scopes used by the tool adapters.
pub mod scopes {
    pub const MAIL_READ: &str = "https://www.googleapis.com/auth/gmail.readonly";
    pub const MAIL_SEND: &str = "https://www.googleapis.com/auth/gmail.send";
    pub const CALENDAR: &str = "https://www.googleapis.com/auth/calendar";
    pub const DRIVE_READ: &str = "https://www.googleapis.com/auth/drive.readonly";
    pub const SHEETS: &str = "https://www.googleapis.com/auth/spreadsheets";
}

// ── Normalized result types ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailSummary {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MailDraft {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub title: String,
    pub start: String,
    pub end: String,
    pub attendees: Vec<String>,
    pub video_link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EventDraft {
    pub title: String,
    pub start: String,
    pub end: String,
    pub attendees: Vec<String>,
    pub description: Option<String>,
    /// Request a video-conference link on the created event.
    pub with_video_link: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub mime: String,
    pub link: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetData {
    pub range: String,
    pub rows: Vec<Vec<String>>,
}

/// Normalized client over the user's linked workspace.
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    async fn list_messages(
        &self,
        cred: &AccessCredential,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MailSummary>, ToolError>;

    /// Send a message; returns the provider message id.
    async fn send_message(
        &self,
        cred: &AccessCredential,
        draft: &MailDraft,
    ) -> Result<String, ToolError>;

    async fn list_events(
        &self,
        cred: &AccessCredential,
        time_min: &str,
        time_max: &str,
    ) -> Result<Vec<EventSummary>, ToolError>;

    async fn create_event(
        &self,
        cred: &AccessCredential,
        draft: &EventDraft,
    ) -> Result<EventSummary, ToolError>;

    async fn search_files(
        &self,
        cred: &AccessCredential,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FileSummary>, ToolError>;

    async fn read_sheet(
        &self,
        cred: &AccessCredential,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<SheetData, ToolError>;

    async fn append_sheet_row(
        &self,
        cred: &AccessCredential,
        spreadsheet_id: &str,
        range: &str,
        values: &[String],
    ) -> Result<(), ToolError>;
}

/// Resolve the calling user's credential for a tool, mapping account errors
/// into the tool error surface. No network happens for an unlinked user.
pub async fn resolve_credential(
    accounts: &LinkedAccounts,
    user_id: i64,
    scope: &str,
    tool: &str,
) -> Result<AccessCredential, ToolError> {
    accounts
        .credential_for(user_id, scope)
        .await
        .map_err(|e| match e {
            AccountError::NotLinked(_) => ToolError::AccountNotLinked,
            AccountError::MissingScope(scope) => ToolError::InsufficientScope(scope),
            other => ToolError::ExecutionFailed {
                name: tool.to_string(),
                reason: other.to_string(),
            },
        })
}

// ── HTTP implementation ─────────────────────────────────────────────

const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const CALENDAR_BASE: &str = "https://www.googleapis.com/calendar/v3";
const DRIVE_BASE: &str = "https://www.googleapis.com/drive/v3";
const SHEETS_BASE: &str = "https://sheets.googleapis.com/v4";

pub struct HttpWorkspaceClient {
    client: reqwest::Client,
}

impl HttpWorkspaceClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(
        &self,
        cred: &AccessCredential,
        url: &str,
        query: &[(&str, String)],
        tool: &str,
    ) -> Result<Value, ToolError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(cred.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| request_err(tool, e))?;
        Self::read_json(response, tool).await
    }

    async fn post_json(
        &self,
        cred: &AccessCredential,
        url: &str,
        body: &Value,
        tool: &str,
    ) -> Result<Value, ToolError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(cred.access_token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| request_err(tool, e))?;
        Self::read_json(response, tool).await
    }

    async fn read_json(response: reqwest::Response, tool: &str) -> Result<Value, ToolError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::RateLimited {
                name: tool.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::ExecutionFailed {
                name: tool.to_string(),
                reason: format!("status {status}: {body}"),
            });
        }
        response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: tool.to_string(),
                reason: format!("malformed response: {e}"),
            })
    }
}

impl Default for HttpWorkspaceClient {
    fn default() -> Self {
        Self::new()
    }
}

fn request_err(tool: &str, e: reqwest::Error) -> ToolError {
    if e.is_timeout() {
        ToolError::Timeout {
            name: tool.to_string(),
            timeout: std::time::Duration::ZERO,
        }
    } else {
        ToolError::ExecutionFailed {
            name: tool.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl WorkspaceClient for HttpWorkspaceClient {
    async fn list_messages(
        &self,
        cred: &AccessCredential,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MailSummary>, ToolError> {
        const TOOL: &str = "list_mail";
        let mut params = vec![("maxResults", limit.to_string())];
        if let Some(q) = query {
            params.push(("q", q.to_string()));
        }
        let listing = self
            .get_json(cred, &format!("{GMAIL_BASE}/users/me/messages"), &params, TOOL)
            .await?;

        let ids: Vec<String> = listing
            .pointer("/messages")
            .and_then(Value::as_array)
            .map(|msgs| {
                msgs.iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // One metadata fetch per message, in parallel.
        let fetches = ids.iter().map(|id| {
            let url = format!("{GMAIL_BASE}/users/me/messages/{id}");
            async move {
                self.get_json(cred, &url, &[("format", "metadata".to_string())], TOOL)
                    .await
            }
        });
        let messages = futures::future::try_join_all(fetches).await?;
        Ok(ids
            .iter()
            .zip(&messages)
            .map(|(id, msg)| parse_mail_summary(id, msg))
            .collect())
    }

    async fn send_message(
        &self,
        cred: &AccessCredential,
        draft: &MailDraft,
    ) -> Result<String, ToolError> {
        const TOOL: &str = "send_mail";
        use base64::Engine;
        let raw = format!(
            "To: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            draft.to, draft.subject, draft.body
        );
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        let response = self
            .post_json(
                cred,
                &format!("{GMAIL_BASE}/users/me/messages/send"),
                &json!({ "raw": encoded }),
                TOOL,
            )
            .await?;
        Ok(response
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn list_events(
        &self,
        cred: &AccessCredential,
        time_min: &str,
        time_max: &str,
    ) -> Result<Vec<EventSummary>, ToolError> {
        const TOOL: &str = "list_events";
        let response = self
            .get_json(
                cred,
                &format!("{CALENDAR_BASE}/calendars/primary/events"),
                &[
                    ("timeMin", time_min.to_string()),
                    ("timeMax", time_max.to_string()),
                    ("singleEvents", "true".to_string()),
                    ("orderBy", "startTime".to_string()),
                ],
                TOOL,
            )
            .await?;
        Ok(response
            .pointer("/items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(parse_event_summary).collect())
            .unwrap_or_default())
    }

    async fn create_event(
        &self,
        cred: &AccessCredential,
        draft: &EventDraft,
    ) -> Result<EventSummary, ToolError> {
        const TOOL: &str = "create_event";
        let mut body = json!({
            "summary": draft.title,
            "start": { "dateTime": draft.start },
            "end": { "dateTime": draft.end },
            "attendees": draft.attendees.iter()
                .map(|a| json!({ "email": a }))
                .collect::<Vec<_>>(),
        });
        if let Some(description) = &draft.description {
            body["description"] = json!(description);
        }
        let mut url = format!("{CALENDAR_BASE}/calendars/primary/events");
        if draft.with_video_link {
            body["conferenceData"] = json!({
                "createRequest": {
                    "requestId": Uuid::new_v4().to_string(),
                    "conferenceSolutionKey": { "type": "hangoutsMeet" }
                }
            });
            url.push_str("?conferenceDataVersion=1");
        }
        let response = self.post_json(cred, &url, &body, TOOL).await?;
        Ok(parse_event_summary(&response))
    }

    async fn search_files(
        &self,
        cred: &AccessCredential,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FileSummary>, ToolError> {
        const TOOL: &str = "search_files";
        let escaped = query.replace('\'', "\\'");
        let response = self
            .get_json(
                cred,
                &format!("{DRIVE_BASE}/files"),
                &[
                    ("q", format!("name contains '{escaped}' and trashed = false")),
                    ("pageSize", limit.to_string()),
                    (
                        "fields",
                        "files(id,name,mimeType,webViewLink,modifiedTime)".to_string(),
                    ),
                ],
                TOOL,
            )
            .await?;
        Ok(response
            .pointer("/files")
            .and_then(Value::as_array)
            .map(|files| files.iter().map(parse_file_summary).collect())
            .unwrap_or_default())
    }

    async fn read_sheet(
        &self,
        cred: &AccessCredential,
        spreadsheet_id: &str,
        range: &str,
    ) -> Result<SheetData, ToolError> {
        const TOOL: &str = "read_sheet";
        let response = self
            .get_json(
                cred,
                &format!("{SHEETS_BASE}/spreadsheets/{spreadsheet_id}/values/{range}"),
                &[],
                TOOL,
            )
            .await?;
        Ok(SheetData {
            range: response
                .get("range")
                .and_then(Value::as_str)
                .unwrap_or(range)
                .to_string(),
            rows: response
                .pointer("/values")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .map(|row| {
                            row.as_array()
                                .map(|cells| {
                                    cells
                                        .iter()
                                        .map(|c| match c {
                                            Value::String(s) => s.clone(),
                                            other => other.to_string(),
                                        })
                                        .collect()
                                })
                                .unwrap_or_default()
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    async fn append_sheet_row(
        &self,
        cred: &AccessCredential,
        spreadsheet_id: &str,
        range: &str,
        values: &[String],
    ) -> Result<(), ToolError> {
        const TOOL: &str = "append_sheet_row";
        self.post_json(
            cred,
            &format!(
                "{SHEETS_BASE}/spreadsheets/{spreadsheet_id}/values/{range}:append?valueInputOption=USER_ENTERED"
            ),
            &json!({ "values": [values] }),
            TOOL,
        )
        .await?;
        Ok(())
    }
}

fn parse_mail_summary(id: &str, msg: &Value) -> MailSummary {
    let mut from = String::new();
    let mut subject = String::new();
    let mut date = None;
    if let Some(headers) = msg.pointer("/payload/headers").and_then(Value::as_array) {
        for header in headers {
            let name = header.get("name").and_then(Value::as_str).unwrap_or("");
            let value = header.get("value").and_then(Value::as_str).unwrap_or("");
            match name.to_ascii_lowercase().as_str() {
                "from" => from = value.to_string(),
                "subject" => subject = value.to_string(),
                "date" => {
                    date = DateTime::parse_from_rfc2822(value)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
                _ => {}
            }
        }
    }
    MailSummary {
        id: id.to_string(),
        from,
        subject,
        snippet: msg
            .get("snippet")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        date,
    }
}

fn parse_event_summary(item: &Value) -> EventSummary {
    let time_of = |key: &str| {
        item.pointer(&format!("/{key}/dateTime"))
            .or_else(|| item.pointer(&format!("/{key}/date")))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    EventSummary {
        id: item
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        title: item
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("(untitled)")
            .to_string(),
        start: time_of("start"),
        end: time_of("end"),
        attendees: item
            .pointer("/attendees")
            .and_then(Value::as_array)
            .map(|attendees| {
                attendees
                    .iter()
                    .filter_map(|a| a.get("email").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        video_link: item
            .get("hangoutLink")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn parse_file_summary(file: &Value) -> FileSummary {
    let text = |key: &str| {
        file.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    FileSummary {
        id: text("id"),
        name: text("name"),
        mime: text("mimeType"),
        link: file
            .get("webViewLink")
            .and_then(Value::as_str)
            .map(str::to_string),
        modified: file
            .get("modifiedTime")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|d| d.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_summary_parses_conference_link() {
        let item = json!({
            "id": "evt1",
            "summary": "Standup",
            "start": { "dateTime": "2026-08-29T09:00:00Z" },
            "end": { "dateTime": "2026-08-29T09:15:00Z" },
            "attendees": [{ "email": "a@example.com" }],
            "hangoutLink": "https://meet.example.com/abc"
        });
        let summary = parse_event_summary(&item);
        assert_eq!(summary.title, "Standup");
        assert_eq!(summary.attendees, vec!["a@example.com"]);
        assert_eq!(summary.video_link.as_deref(), Some("https://meet.example.com/abc"));
    }

    #[test]
    fn event_summary_handles_all_day_events() {
        let item = json!({
            "id": "evt2",
            "summary": "Holiday",
            "start": { "date": "2026-09-01" },
            "end": { "date": "2026-09-02" }
        });
        let summary = parse_event_summary(&item);
        assert_eq!(summary.start, "2026-09-01");
        assert!(summary.video_link.is_none());
    }

    #[test]
    fn mail_summary_reads_headers() {
        let msg = json!({
            "snippet": "Quarterly numbers attached",
            "payload": { "headers": [
                { "name": "From", "value": "cfo@example.com" },
                { "name": "Subject", "value": "Q3 report" },
                { "name": "Date", "value": "Fri, 28 Aug 2026 10:00:00 +0000" }
            ]}
        });
        let summary = parse_mail_summary("m1", &msg);
        assert_eq!(summary.from, "cfo@example.com");
        assert_eq!(summary.subject, "Q3 report");
        assert!(summary.date.is_some());
    }
}
