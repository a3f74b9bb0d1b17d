//! Admission gate — authorizes or denies a sender before any processing.
//!
//! The blocked check is the very first step of handling any message: a
//! blocked or unregistered sender never incurs model or tool cost.

use std::sync::Arc;

use rand::Rng;
use tracing::{info, warn};

use crate::error::AdmissionError;
use crate::store::{Database, Identity};

/// Outcome of admitting an inbound sender.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Registered and allowed; carries the resolved identity.
    Allowed(Identity),
    /// Sender has never registered.
    DeniedUnregistered,
    /// Sender was registered but an administrator revoked access.
    DeniedBlocked,
}

/// Outcome of an invite redemption.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// The code was consumed and the identity created (or re-allowed).
    Consumed(Identity),
}

/// Gate over the identity and invite tables.
///
/// Holds an injected store so tests can substitute a fake; no ambient state.
pub struct AdmissionGate {
    db: Arc<dyn Database>,
}

impl AdmissionGate {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Admit or deny a sender. Never mutates except for the activity
    /// timestamp on an allowed sender.
    pub async fn check(&self, chat_id: &str) -> Result<Admission, AdmissionError> {
        match self.db.get_identity(chat_id).await? {
            None => Ok(Admission::DeniedUnregistered),
            Some(identity) if !identity.is_allowed => Ok(Admission::DeniedBlocked),
            Some(identity) => {
                if let Err(e) = self.db.touch_last_seen(identity.id).await {
                    warn!(user_id = identity.id, "Failed to update last_seen: {e}");
                }
                Ok(Admission::Allowed(identity))
            }
        }
    }

    /// Redeem an invite code for a sender.
    ///
    /// The code is consumed with a compare-and-swap, so concurrent attempts
    /// on the same code are serialized: exactly one caller wins, the rest
    /// observe `InvalidInvite`. No mutation happens on failure.
    pub async fn register(
        &self,
        chat_id: &str,
        display_name: Option<&str>,
        code: &str,
    ) -> Result<Registration, AdmissionError> {
        let code = code.trim().to_ascii_uppercase();

        if let Some(existing) = self.db.get_identity(chat_id).await? {
            if existing.is_allowed {
                return Err(AdmissionError::AlreadyRegistered(chat_id.to_string()));
            }
            // Blocked users stay blocked; a fresh invite does not bypass an
            // administrative revocation.
            return Err(AdmissionError::InvalidInvite);
        }

        let invite_id = self
            .db
            .consume_invite(&code)
            .await?
            .ok_or(AdmissionError::InvalidInvite)?;

        let identity = self
            .db
            .create_identity(chat_id, display_name, invite_id)
            .await?;
        self.db.bind_invite(invite_id, identity.id).await?;

        info!(user_id = identity.id, chat_id, "Invite redeemed");
        Ok(Registration::Consumed(identity))
    }

    /// Generate a fresh invite code for the operator surface.
    pub async fn mint_invite(
        &self,
        intended_for: Option<&str>,
    ) -> Result<String, AdmissionError> {
        let code = generate_code(8);
        self.db.create_invite(&code, intended_for).await?;
        Ok(code)
    }
}

/// Uppercase alphanumeric code, unambiguous alphabet (no 0/O, 1/I).
fn generate_code(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn gate() -> (AdmissionGate, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (AdmissionGate::new(Arc::clone(&db)), db)
    }

    #[tokio::test]
    async fn unregistered_sender_denied() {
        let (gate, _db) = gate().await;
        assert_eq!(
            gate.check("tg:999").await.unwrap(),
            Admission::DeniedUnregistered
        );
    }

    #[tokio::test]
    async fn register_then_allowed() {
        let (gate, db) = gate().await;
        db.create_invite("WELCOME1", Some("Bob")).await.unwrap();

        let reg = gate
            .register("tg:1", Some("Bob"), "welcome1")
            .await
            .unwrap();
        let Registration::Consumed(identity) = reg;
        assert!(identity.is_allowed);

        match gate.check("tg:1").await.unwrap() {
            Admission::Allowed(id) => assert_eq!(id.id, identity.id),
            other => panic!("expected Allowed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocked_sender_denied() {
        let (gate, db) = gate().await;
        db.create_invite("C1", None).await.unwrap();
        let Registration::Consumed(identity) =
            gate.register("tg:1", None, "C1").await.unwrap();

        db.set_allowed(identity.id, false).await.unwrap();
        assert_eq!(gate.check("tg:1").await.unwrap(), Admission::DeniedBlocked);
    }

    #[tokio::test]
    async fn invalid_invite_makes_no_mutation() {
        let (gate, db) = gate().await;
        let result = gate.register("tg:1", None, "BOGUS").await;
        assert!(matches!(result, Err(AdmissionError::InvalidInvite)));
        assert!(db.get_identity("tg:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn used_invite_rejected() {
        let (gate, db) = gate().await;
        db.create_invite("ONCE", None).await.unwrap();
        gate.register("tg:1", None, "ONCE").await.unwrap();

        let result = gate.register("tg:2", None, "ONCE").await;
        assert!(matches!(result, Err(AdmissionError::InvalidInvite)));
        assert!(db.get_identity("tg:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_redemption_single_winner() {
        let (gate, db) = gate().await;
        db.create_invite("RACE", None).await.unwrap();
        let gate = Arc::new(gate);

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                gate.register(&format!("tg:{i}"), None, "RACE").await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let invite = db.get_invite("RACE").await.unwrap().unwrap();
        assert!(invite.is_used);
    }

    #[tokio::test]
    async fn blocked_user_cannot_re_register() {
        let (gate, db) = gate().await;
        db.create_invite("C1", None).await.unwrap();
        db.create_invite("C2", None).await.unwrap();
        let Registration::Consumed(identity) =
            gate.register("tg:1", None, "C1").await.unwrap();
        db.set_allowed(identity.id, false).await.unwrap();

        let result = gate.register("tg:1", None, "C2").await;
        assert!(matches!(result, Err(AdmissionError::InvalidInvite)));
        // The second code stays unused.
        assert!(!db.get_invite("C2").await.unwrap().unwrap().is_used);
    }

    #[test]
    fn generated_codes_use_safe_alphabet() {
        let code = generate_code(8);
        assert_eq!(code.len(), 8);
        assert!(!code.contains('0') && !code.contains('O'));
        assert!(!code.contains('1') && !code.contains('I'));
    }
}
