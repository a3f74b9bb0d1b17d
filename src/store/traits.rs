//! Unified `Database` trait — single async interface for all persistence.
//!
//! The external admin surface reads and mutates the same tables directly;
//! this trait covers only what the core needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;

/// A chat-platform user known to the system.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Internal numeric id.
    pub id: i64,
    /// Stable external chat identifier.
    pub chat_id: String,
    pub display_name: Option<String>,
    /// Blocked users carry `false`; they never reach the orchestrator.
    pub is_allowed: bool,
    pub voice_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A registration token created by an operator.
#[derive(Debug, Clone)]
pub struct InviteCode {
    pub id: i64,
    pub code: String,
    /// Intended recipient, free-form (name or phone).
    pub intended_for: Option<String>,
    pub is_used: bool,
    pub redeemed_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Stored delegated-authorization credential for one user.
///
/// Token material is kept out of `Debug` output; wrap in
/// `secrecy::SecretString` at the call site before use.
#[derive(Clone)]
pub struct StoredCredential {
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("user_id", &self.user_id)
            .field("expiry", &self.expiry)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

/// Direction of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// One persisted transcript entry.
#[derive(Debug, Clone)]
pub struct TranscriptRow {
    pub id: String,
    pub user_id: i64,
    pub direction: Direction,
    /// Content-type tag: text/image/document/audio/video/url.
    pub kind: String,
    pub content: String,
    pub file_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One vector-indexed memory record.
#[derive(Debug, Clone)]
pub struct MemoryRow {
    pub id: String,
    pub user_id: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering identities, invites, linked
/// accounts, the transcript, and memory records.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Identities ──────────────────────────────────────────────────

    async fn get_identity(&self, chat_id: &str) -> Result<Option<Identity>, DatabaseError>;

    async fn get_identity_by_id(&self, user_id: i64) -> Result<Option<Identity>, DatabaseError>;

    /// Create an identity bound to a redeemed invite. Fails on duplicate
    /// chat_id with `Constraint`.
    async fn create_identity(
        &self,
        chat_id: &str,
        display_name: Option<&str>,
        invite_id: i64,
    ) -> Result<Identity, DatabaseError>;

    async fn set_allowed(&self, user_id: i64, allowed: bool) -> Result<(), DatabaseError>;

    async fn set_voice_enabled(&self, user_id: i64, enabled: bool) -> Result<(), DatabaseError>;

    /// Update the activity timestamp shown on the admin surface.
    async fn touch_last_seen(&self, user_id: i64) -> Result<(), DatabaseError>;

    /// Administrative removal. Cascades to transcript, memories, and the
    /// linked account.
    async fn delete_identity(&self, user_id: i64) -> Result<(), DatabaseError>;

    // ── Invite codes ────────────────────────────────────────────────

    async fn create_invite(
        &self,
        code: &str,
        intended_for: Option<&str>,
    ) -> Result<InviteCode, DatabaseError>;

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, DatabaseError>;

    /// Atomically consume an unused invite (compare-and-swap on `is_used`).
    /// Returns the invite id when this caller won, `None` when the code does
    /// not exist or was already used. The used flag never reverts.
    async fn consume_invite(&self, code: &str) -> Result<Option<i64>, DatabaseError>;

    /// Bind a consumed invite to the identity that redeemed it.
    async fn bind_invite(&self, invite_id: i64, user_id: i64) -> Result<(), DatabaseError>;

    /// Total number of invite codes ever created, used or not.
    async fn count_invites(&self) -> Result<u64, DatabaseError>;

    // ── Linked accounts ─────────────────────────────────────────────

    async fn get_credential(&self, user_id: i64)
    -> Result<Option<StoredCredential>, DatabaseError>;

    async fn upsert_credential(&self, cred: &StoredCredential) -> Result<(), DatabaseError>;

    /// Persist a refreshed access token without touching the refresh token.
    async fn update_access_token(
        &self,
        user_id: i64,
        access_token: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Destroy the credential. Returns whether a row existed. Must complete
    /// before an unlink command reports success.
    async fn delete_credential(&self, user_id: i64) -> Result<bool, DatabaseError>;

    // ── Transcript ──────────────────────────────────────────────────

    /// Append one transcript entry. The transcript is append-only; rows are
    /// never mutated after write.
    async fn append_transcript(&self, row: &TranscriptRow) -> Result<(), DatabaseError>;

    /// Most recent entries for a user, oldest first.
    async fn recent_transcript(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<TranscriptRow>, DatabaseError>;

    // ── Memory records ──────────────────────────────────────────────

    async fn insert_memory(&self, row: &MemoryRow) -> Result<(), DatabaseError>;

    /// Memory records for a user newer than `since`, newest first.
    async fn list_memories(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryRow>, DatabaseError>;
}
