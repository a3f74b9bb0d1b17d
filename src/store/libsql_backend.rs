//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use; single-statement
//! compare-and-swap updates provide the per-row exclusion the invite and
//! credential tables require.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Database, Direction, Identity, InviteCode, MemoryRow, StoredCredential, TranscriptRow,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn query_err(e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

fn row_to_identity(row: &libsql::Row) -> Result<Identity, DatabaseError> {
    let created: String = row.get(5).map_err(query_err)?;
    Ok(Identity {
        id: row.get(0).map_err(query_err)?,
        chat_id: row.get(1).map_err(query_err)?,
        display_name: row.get(2).map_err(query_err)?,
        is_allowed: row.get::<i64>(3).map_err(query_err)? != 0,
        voice_enabled: row.get::<i64>(4).map_err(query_err)? != 0,
        created_at: parse_datetime(&created),
    })
}

const IDENTITY_COLUMNS: &str =
    "id, chat_id, display_name, is_allowed, voice_enabled, created_at";

fn row_to_invite(row: &libsql::Row) -> Result<InviteCode, DatabaseError> {
    let created: String = row.get(5).map_err(query_err)?;
    Ok(InviteCode {
        id: row.get(0).map_err(query_err)?,
        code: row.get(1).map_err(query_err)?,
        intended_for: row.get(2).map_err(query_err)?,
        is_used: row.get::<i64>(3).map_err(query_err)? != 0,
        redeemed_by: row.get(4).map_err(query_err)?,
        created_at: parse_datetime(&created),
    })
}

const INVITE_COLUMNS: &str = "id, code, intended_for, is_used, redeemed_by, created_at";

fn row_to_transcript(row: &libsql::Row) -> Result<TranscriptRow, DatabaseError> {
    let direction: String = row.get(2).map_err(query_err)?;
    let created: String = row.get(6).map_err(query_err)?;
    Ok(TranscriptRow {
        id: row.get(0).map_err(query_err)?,
        user_id: row.get(1).map_err(query_err)?,
        direction: if direction == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        kind: row.get(3).map_err(query_err)?,
        content: row.get(4).map_err(query_err)?,
        file_name: row.get(5).map_err(query_err)?,
        created_at: parse_datetime(&created),
    })
}

const TRANSCRIPT_COLUMNS: &str = "id, user_id, direction, kind, content, file_name, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Identities ──────────────────────────────────────────────────

    async fn get_identity(&self, chat_id: &str) -> Result<Option<Identity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE chat_id = ?1"),
                params![chat_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_identity(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_identity_by_id(&self, user_id: i64) -> Result<Option<Identity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE id = ?1"),
                params![user_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_identity(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_identity(
        &self,
        chat_id: &str,
        display_name: Option<&str>,
        invite_id: i64,
    ) -> Result<Identity, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO users (chat_id, display_name, is_allowed, invite_id, last_seen, created_at)
                 VALUES (?1, ?2, 1, ?3, ?4, ?4)",
                params![chat_id, display_name, invite_id, now],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("chat_id {chat_id} already registered"))
                } else {
                    DatabaseError::Query(msg)
                }
            })?;

        let id = self.conn().last_insert_rowid();
        debug!(user_id = id, chat_id, "Identity created");
        self.get_identity_by_id(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "user".into(),
            id: id.to_string(),
        })
    }

    async fn set_allowed(&self, user_id: i64, allowed: bool) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE users SET is_allowed = ?1 WHERE id = ?2",
                params![allowed as i64, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_voice_enabled(&self, user_id: i64, enabled: bool) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE users SET voice_enabled = ?1 WHERE id = ?2",
                params![enabled as i64, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn touch_last_seen(&self, user_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE users SET last_seen = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn delete_identity(&self, user_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM users WHERE id = ?1", params![user_id])
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Invite codes ────────────────────────────────────────────────

    async fn create_invite(
        &self,
        code: &str,
        intended_for: Option<&str>,
    ) -> Result<InviteCode, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO invite_codes (code, intended_for, created_at) VALUES (?1, ?2, ?3)",
                params![code, intended_for, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("invite code {code} already exists"))
                } else {
                    DatabaseError::Query(msg)
                }
            })?;
        self.get_invite(code).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "invite".into(),
            id: code.to_string(),
        })
    }

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INVITE_COLUMNS} FROM invite_codes WHERE code = ?1"),
                params![code],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_invite(&row)?)),
            None => Ok(None),
        }
    }

    async fn consume_invite(&self, code: &str) -> Result<Option<i64>, DatabaseError> {
        // Single-statement CAS: first writer wins, the loser sees 0 rows.
        let affected = self
            .conn()
            .execute(
                "UPDATE invite_codes SET is_used = 1, used_at = ?1 WHERE code = ?2 AND is_used = 0",
                params![Utc::now().to_rfc3339(), code],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            return Ok(None);
        }
        let invite = self.get_invite(code).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "invite".into(),
            id: code.to_string(),
        })?;
        Ok(Some(invite.id))
    }

    async fn bind_invite(&self, invite_id: i64, user_id: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE invite_codes SET redeemed_by = ?1 WHERE id = ?2",
                params![user_id, invite_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn count_invites(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM invite_codes", ())
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get::<u64>(0).map_err(query_err),
            None => Ok(0),
        }
    }

    // ── Linked accounts ─────────────────────────────────────────────

    async fn get_credential(
        &self,
        user_id: i64,
    ) -> Result<Option<StoredCredential>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, access_token, refresh_token, expiry, scopes
                 FROM linked_accounts WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let expiry: Option<String> = row.get(3).map_err(query_err)?;
                let scopes_json: String = row.get(4).map_err(query_err)?;
                let scopes: Vec<String> =
                    serde_json::from_str(&scopes_json).unwrap_or_default();
                Ok(Some(StoredCredential {
                    user_id: row.get(0).map_err(query_err)?,
                    access_token: row.get(1).map_err(query_err)?,
                    refresh_token: row.get(2).map_err(query_err)?,
                    expiry: parse_optional_datetime(&expiry),
                    scopes,
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_credential(&self, cred: &StoredCredential) -> Result<(), DatabaseError> {
        let scopes = serde_json::to_string(&cred.scopes)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO linked_accounts (user_id, access_token, refresh_token, expiry, scopes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expiry = excluded.expiry,
                    scopes = excluded.scopes",
                params![
                    cred.user_id,
                    cred.access_token.as_str(),
                    cred.refresh_token.as_str(),
                    cred.expiry.map(|e| e.to_rfc3339()),
                    scopes,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_access_token(
        &self,
        user_id: i64,
        access_token: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE linked_accounts SET access_token = ?1, expiry = ?2 WHERE user_id = ?3",
                params![access_token, expiry.map(|e| e.to_rfc3339()), user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn delete_credential(&self, user_id: i64) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM linked_accounts WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    // ── Transcript ──────────────────────────────────────────────────

    async fn append_transcript(&self, row: &TranscriptRow) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO transcript (id, user_id, direction, kind, content, file_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id.as_str(),
                    row.user_id,
                    row.direction.as_str(),
                    row.kind.as_str(),
                    row.content.as_str(),
                    row.file_name.as_deref(),
                    row.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn recent_transcript(
        &self,
        user_id: i64,
        limit: usize,
    ) -> Result<Vec<TranscriptRow>, DatabaseError> {
        // Fetch newest first, then reverse so callers get chronological order.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSCRIPT_COLUMNS} FROM transcript WHERE user_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_transcript(&row)?);
        }
        out.reverse();
        Ok(out)
    }

    // ── Memory records ──────────────────────────────────────────────

    async fn insert_memory(&self, row: &MemoryRow) -> Result<(), DatabaseError> {
        let embedding = serde_json::to_string(&row.embedding)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO memories (id, user_id, content, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id.as_str(),
                    row.user_id,
                    row.content.as_str(),
                    embedding,
                    row.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn list_memories(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MemoryRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, content, embedding, created_at FROM memories
                 WHERE user_id = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC LIMIT ?3",
                params![user_id, since.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let embedding_json: String = row.get(3).map_err(query_err)?;
            let created: String = row.get(4).map_err(query_err)?;
            out.push(MemoryRow {
                id: row.get(0).map_err(query_err)?,
                user_id: row.get(1).map_err(query_err)?,
                content: row.get(2).map_err(query_err)?,
                embedding: serde_json::from_str(&embedding_json).unwrap_or_default(),
                created_at: parse_datetime(&created),
            });
        }
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_and_get_identity() {
        let db = test_db().await;
        let invite = db.create_invite("ALPHA1", Some("Alice")).await.unwrap();
        let user = db
            .create_identity("tg:100", Some("Alice"), invite.id)
            .await
            .unwrap();

        assert!(user.is_allowed);
        assert!(!user.voice_enabled);

        let loaded = db.get_identity("tg:100").await.unwrap().unwrap();
        assert_eq!(loaded.id, user.id);
        assert_eq!(loaded.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn invite_count_tracks_creates_not_consumption() {
        let db = test_db().await;
        assert_eq!(db.count_invites().await.unwrap(), 0);

        db.create_invite("CNT1", None).await.unwrap();
        db.create_invite("CNT2", None).await.unwrap();
        assert_eq!(db.count_invites().await.unwrap(), 2);

        db.consume_invite("CNT1").await.unwrap();
        // Consumed codes keep their row.
        assert_eq!(db.count_invites().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concierge.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_invite("KEEP01", None).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let invite = db.get_invite("KEEP01").await.unwrap().unwrap();
        assert!(!invite.is_used);
    }

    #[tokio::test]
    async fn duplicate_chat_id_rejected() {
        let db = test_db().await;
        let invite = db.create_invite("ALPHA1", None).await.unwrap();
        db.create_identity("tg:100", None, invite.id).await.unwrap();

        let result = db.create_identity("tg:100", None, invite.id).await;
        assert!(matches!(result, Err(DatabaseError::Constraint(_))));
    }

    #[tokio::test]
    async fn consume_invite_is_single_use() {
        let db = test_db().await;
        db.create_invite("CODE42", None).await.unwrap();

        let first = db.consume_invite("CODE42").await.unwrap();
        assert!(first.is_some());

        let second = db.consume_invite("CODE42").await.unwrap();
        assert!(second.is_none());

        // Used flag never reverts.
        let invite = db.get_invite("CODE42").await.unwrap().unwrap();
        assert!(invite.is_used);
    }

    #[tokio::test]
    async fn consume_unknown_invite() {
        let db = test_db().await;
        assert!(db.consume_invite("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn credential_lifecycle() {
        let db = test_db().await;
        let invite = db.create_invite("C1", None).await.unwrap();
        let user = db.create_identity("tg:1", None, invite.id).await.unwrap();

        assert!(db.get_credential(user.id).await.unwrap().is_none());

        let cred = StoredCredential {
            user_id: user.id,
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
            expiry: Some(Utc::now()),
            scopes: vec!["mail.send".into()],
        };
        db.upsert_credential(&cred).await.unwrap();

        let loaded = db.get_credential(user.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "at-1");
        assert_eq!(loaded.scopes, vec!["mail.send".to_string()]);

        db.update_access_token(user.id, "at-2", None).await.unwrap();
        let refreshed = db.get_credential(user.id).await.unwrap().unwrap();
        assert_eq!(refreshed.access_token, "at-2");
        assert_eq!(refreshed.refresh_token, "rt-1");

        assert!(db.delete_credential(user.id).await.unwrap());
        assert!(db.get_credential(user.id).await.unwrap().is_none());
        assert!(!db.delete_credential(user.id).await.unwrap());
    }

    #[tokio::test]
    async fn transcript_round_trip_in_order() {
        let db = test_db().await;
        let invite = db.create_invite("C1", None).await.unwrap();
        let user = db.create_identity("tg:1", None, invite.id).await.unwrap();

        for (i, dir) in [Direction::Inbound, Direction::Outbound].iter().enumerate() {
            db.append_transcript(&TranscriptRow {
                id: Uuid::new_v4().to_string(),
                user_id: user.id,
                direction: *dir,
                kind: "text".into(),
                content: format!("msg {i}"),
                file_name: None,
                created_at: Utc::now() + chrono::Duration::seconds(i as i64),
            })
            .await
            .unwrap();
        }

        let rows = db.recent_transcript(user.id, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].direction, Direction::Inbound);
        assert_eq!(rows[1].direction, Direction::Outbound);
    }

    #[tokio::test]
    async fn delete_identity_cascades() {
        let db = test_db().await;
        let invite = db.create_invite("C1", None).await.unwrap();
        let user = db.create_identity("tg:1", None, invite.id).await.unwrap();

        db.append_transcript(&TranscriptRow {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            direction: Direction::Inbound,
            kind: "text".into(),
            content: "hello".into(),
            file_name: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        db.delete_identity(user.id).await.unwrap();
        assert!(db.get_identity("tg:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_rows_filtered_by_age() {
        let db = test_db().await;
        let invite = db.create_invite("C1", None).await.unwrap();
        let user = db.create_identity("tg:1", None, invite.id).await.unwrap();

        let old = MemoryRow {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            content: "ancient".into(),
            embedding: vec![1.0, 0.0],
            created_at: Utc::now() - chrono::Duration::days(365),
        };
        let fresh = MemoryRow {
            id: Uuid::new_v4().to_string(),
            user_id: user.id,
            content: "recent".into(),
            embedding: vec![0.0, 1.0],
            created_at: Utc::now(),
        };
        db.insert_memory(&old).await.unwrap();
        db.insert_memory(&fresh).await.unwrap();

        let since = Utc::now() - chrono::Duration::days(90);
        let rows = db.list_memories(user.id, since, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "recent");
    }
}
