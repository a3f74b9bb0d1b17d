//! Transcript recorder — the append-only log of everything in and out.
//!
//! Recording failures are logged and swallowed: the transcript never blocks
//! a reply. Inbound rows are written before orchestration starts, so a turn
//! that dies mid-flight still leaves the user's message on record.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::compose::ComposedReply;
use crate::ingest::ContentUnit;
use crate::llm::ChatMessage;
use crate::store::{Database, Direction, TranscriptRow};

pub struct TranscriptRecorder {
    db: Arc<dyn Database>,
}

impl TranscriptRecorder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Record the inbound message, one row per content unit.
    pub async fn record_inbound(&self, user_id: i64, units: &[ContentUnit]) {
        for unit in units {
            let row = TranscriptRow {
                id: Uuid::new_v4().to_string(),
                user_id,
                direction: Direction::Inbound,
                kind: unit.kind().to_string(),
                content: unit.transcript_content(),
                file_name: unit.file_name().map(str::to_string),
                created_at: Utc::now(),
            };
            self.append(&row).await;
        }
    }

    /// Record the outbound reply. Voice replies log their transcript text
    /// with a voice tag; the audio itself is not stored.
    pub async fn record_outbound(&self, user_id: i64, reply: &ComposedReply) {
        let kind = match reply {
            ComposedReply::Voice { .. } => "voice",
            ComposedReply::Text(_) | ComposedReply::VoiceFallback(_) => "text",
        };
        let row = TranscriptRow {
            id: Uuid::new_v4().to_string(),
            user_id,
            direction: Direction::Outbound,
            kind: kind.to_string(),
            content: reply.text().to_string(),
            file_name: None,
            created_at: Utc::now(),
        };
        self.append(&row).await;
    }

    /// Record a plain outbound message, used for error replies and
    /// registration responses.
    pub async fn record_outbound_text(&self, user_id: i64, text: &str) {
        let row = TranscriptRow {
            id: Uuid::new_v4().to_string(),
            user_id,
            direction: Direction::Outbound,
            kind: "text".to_string(),
            content: text.to_string(),
            file_name: None,
            created_at: Utc::now(),
        };
        self.append(&row).await;
    }

    async fn append(&self, row: &TranscriptRow) {
        if let Err(e) = self.db.append_transcript(row).await {
            warn!(user_id = row.user_id, "Failed to append transcript row: {e}");
        }
    }

    /// Recent conversation as model messages, oldest first. Media rows are
    /// replayed as their textual summaries.
    pub async fn history(&self, user_id: i64, limit: usize) -> Vec<ChatMessage> {
        let rows = match self.db.recent_transcript(user_id, limit).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(user_id, "Failed to load transcript history: {e}");
                return Vec::new();
            }
        };
        rows.into_iter()
            .map(|row| match row.direction {
                Direction::Inbound => ChatMessage::user_text(row.content),
                Direction::Outbound => ChatMessage::Assistant {
                    text: Some(row.content),
                    tool_calls: vec![],
                },
            })
            .collect()
    }
}
