//! Linked workspace accounts — delegated-authorization credential lifecycle.
//!
//! Tools never see refresh tokens or raw rows: they ask for an access
//! credential scoped to what they need, and refresh happens here, serialized
//! per user so concurrent tool calls produce one refresh, not a stampede.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::OAuthConfig;
use crate::error::AccountError;
use crate::store::{Database, StoredCredential};

/// A ready-to-use access credential handed to a tool.
#[derive(Clone)]
pub struct AccessCredential {
    pub access_token: SecretString,
    pub scopes: Vec<String>,
}

/// Exchanges a refresh token for a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, AccountError>;
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub expires_in: Option<Duration>,
}

/// Refresher against the provider's OAuth token endpoint.
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl HttpTokenRefresher {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, AccountError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
        ];
        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| AccountError::RefreshFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AccountError::RefreshFailed(format!("status {status}: {body}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AccountError::RefreshFailed(format!("malformed token response: {e}")))?;
        let access_token = body
            .get("access_token")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| AccountError::RefreshFailed("missing access_token".to_string()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_secs);
        Ok(RefreshedToken {
            access_token,
            expires_in,
        })
    }
}

/// Tokens within this margin of expiry are refreshed proactively.
const EXPIRY_MARGIN_SECS: i64 = 60;

pub struct LinkedAccounts {
    db: Arc<dyn Database>,
    refresher: Arc<dyn TokenRefresher>,
    /// One lock per user so refresh is never concurrent for the same account.
    refresh_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl LinkedAccounts {
    pub fn new(db: Arc<dyn Database>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            db,
            refresher,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Store (or replace) a user's credential after authorization.
    pub async fn link(&self, cred: &StoredCredential) -> Result<(), AccountError> {
        self.db.upsert_credential(cred).await?;
        info!(user_id = cred.user_id, "Workspace account linked");
        Ok(())
    }

    /// Destroy the stored credential. Completes before reporting; a tool call
    /// arriving afterwards fails locally without any network traffic.
    pub async fn unlink(&self, user_id: i64) -> Result<bool, AccountError> {
        let existed = self.db.delete_credential(user_id).await?;
        if existed {
            info!(user_id, "Workspace account unlinked");
        }
        Ok(existed)
    }

    /// Whether the user has a linked account at all.
    pub async fn is_linked(&self, user_id: i64) -> Result<bool, AccountError> {
        Ok(self.db.get_credential(user_id).await?.is_some())
    }

    /// Resolve a usable access credential for one tool call.
    ///
    /// Refresh is a single explicit step: expired tokens are exchanged here,
    /// and a failed exchange surfaces as `RefreshFailed` rather than letting
    /// the tool hit the API with a dead token.
    pub async fn credential_for(
        &self,
        user_id: i64,
        required_scope: &str,
    ) -> Result<AccessCredential, AccountError> {
        let cred = self
            .db
            .get_credential(user_id)
            .await?
            .ok_or(AccountError::NotLinked(user_id))?;

        if !has_scope(&cred.scopes, required_scope) {
            return Err(AccountError::MissingScope(required_scope.to_string()));
        }

        if !is_expired(cred.expiry, Utc::now()) {
            return Ok(AccessCredential {
                access_token: SecretString::from(cred.access_token),
                scopes: cred.scopes,
            });
        }

        let lock = self.lock_for(user_id).await;
        let _guard = lock.lock().await;

        // Another call may have refreshed while we waited on the lock.
        let cred = self
            .db
            .get_credential(user_id)
            .await?
            .ok_or(AccountError::NotLinked(user_id))?;
        if !is_expired(cred.expiry, Utc::now()) {
            return Ok(AccessCredential {
                access_token: SecretString::from(cred.access_token),
                scopes: cred.scopes,
            });
        }

        warn!(user_id, "Access token expired, refreshing");
        let refreshed = self.refresher.refresh(&cred.refresh_token).await?;
        let expiry = refreshed
            .expires_in
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        self.db
            .update_access_token(user_id, &refreshed.access_token, expiry)
            .await?;

        Ok(AccessCredential {
            access_token: SecretString::from(refreshed.access_token),
            scopes: cred.scopes,
        })
    }

    async fn lock_for(&self, user_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        Arc::clone(locks.entry(user_id).or_default())
    }
}

fn has_scope(scopes: &[String], required: &str) -> bool {
    scopes.iter().any(|s| s == required)
}

fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expiry {
        Some(expiry) => expiry <= now + ChronoDuration::seconds(EXPIRY_MARGIN_SECS),
        // No recorded expiry: treat as live and let the API reject if not.
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::store::LibSqlBackend;

    struct CountingRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedToken, AccountError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AccountError::RefreshFailed("revoked".into()));
            }
            Ok(RefreshedToken {
                access_token: "fresh-token".into(),
                expires_in: Some(Duration::from_secs(3600)),
            })
        }
    }

    async fn setup(fail_refresh: bool) -> (Arc<LinkedAccounts>, Arc<dyn Database>, i64, Arc<CountingRefresher>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.create_invite("A1", None).await.unwrap();
        let invite_id = db.consume_invite("A1").await.unwrap().unwrap();
        let identity = db.create_identity("tg:1", None, invite_id).await.unwrap();
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            fail: fail_refresh,
        });
        let accounts = Arc::new(LinkedAccounts::new(
            Arc::clone(&db),
            Arc::clone(&refresher) as Arc<dyn TokenRefresher>,
        ));
        (accounts, db, identity.id, refresher)
    }

    fn credential(user_id: i64, expiry: Option<DateTime<Utc>>) -> StoredCredential {
        StoredCredential {
            user_id,
            access_token: "stored-token".into(),
            refresh_token: "refresh-token".into(),
            expiry,
            scopes: vec!["calendar".into(), "mail".into()],
        }
    }

    #[tokio::test]
    async fn unlinked_user_fails_without_refresher_call() {
        let (accounts, _db, user, refresher) = setup(false).await;
        let result = accounts.credential_for(user, "calendar").await;
        assert!(matches!(result, Err(AccountError::NotLinked(_))));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn live_token_returned_without_refresh() {
        let (accounts, _db, user, refresher) = setup(false).await;
        accounts
            .link(&credential(user, Some(Utc::now() + ChronoDuration::hours(1))))
            .await
            .unwrap();

        let cred = accounts.credential_for(user, "calendar").await.unwrap();
        assert_eq!(cred.access_token.expose_secret(), "stored-token");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let (accounts, db, user, refresher) = setup(false).await;
        accounts
            .link(&credential(user, Some(Utc::now() - ChronoDuration::hours(1))))
            .await
            .unwrap();

        let cred = accounts.credential_for(user, "calendar").await.unwrap();
        assert_eq!(cred.access_token.expose_secret(), "fresh-token");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let stored = db.get_credential(user).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh-token");
        assert_eq!(stored.refresh_token, "refresh-token");
    }

    #[tokio::test]
    async fn concurrent_expired_calls_refresh_once() {
        let (accounts, _db, user, refresher) = setup(false).await;
        accounts
            .link(&credential(user, Some(Utc::now() - ChronoDuration::hours(1))))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let accounts = Arc::clone(&accounts);
            handles.push(tokio::spawn(async move {
                accounts.credential_for(user, "calendar").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_scope_rejected_before_refresh() {
        let (accounts, _db, user, refresher) = setup(false).await;
        accounts
            .link(&credential(user, Some(Utc::now() - ChronoDuration::hours(1))))
            .await
            .unwrap();

        let result = accounts.credential_for(user, "sheets").await;
        assert!(matches!(result, Err(AccountError::MissingScope(_))));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_failure_surfaces() {
        let (accounts, _db, user, _) = setup(true).await;
        accounts
            .link(&credential(user, Some(Utc::now() - ChronoDuration::hours(1))))
            .await
            .unwrap();

        let result = accounts.credential_for(user, "calendar").await;
        assert!(matches!(result, Err(AccountError::RefreshFailed(_))));
    }

    #[tokio::test]
    async fn unlink_is_immediate_and_idempotent() {
        let (accounts, _db, user, refresher) = setup(false).await;
        accounts
            .link(&credential(user, Some(Utc::now() + ChronoDuration::hours(1))))
            .await
            .unwrap();

        assert!(accounts.unlink(user).await.unwrap());
        assert!(!accounts.unlink(user).await.unwrap());

        // Subsequent calls fail locally, before any network traffic.
        let result = accounts.credential_for(user, "calendar").await;
        assert!(matches!(result, Err(AccountError::NotLinked(_))));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }
}
