//! Inbound pipeline — admission, normalization, orchestration, composition.
//!
//! Turns for the same sender run strictly one at a time; different senders
//! proceed in parallel. Admission is the first step of every event: denied
//! senders never reach the normalizer, the model, or any tool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::accounts::LinkedAccounts;
use crate::agent::{CancelToken, Orchestrator, orchestrator::TurnInput, units_to_parts};
use crate::compose::{ComposedReply, ResponseComposer};
use crate::config::CoreConfig;
use crate::error::{AdmissionError, Error, IngestError, OrchestratorError};
use crate::gate::{Admission, AdmissionGate, Registration};
use crate::ingest::{ContentUnit, Normalizer, RawPayload};
use crate::memory::MemoryStore;
use crate::transcript::TranscriptRecorder;

/// What a sender is asking for.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    Message(RawPayload),
    /// Invite redemption.
    Register { code: String },
    /// Detach the linked workspace account.
    Unlink,
}

/// One event from the chat transport.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Stable chat identifier of the sender.
    pub sender: String,
    pub display_name: Option<String>,
    pub payload: InboundPayload,
}

/// Shared components the pipeline runs against.
pub struct PipelineDeps {
    pub gate: AdmissionGate,
    pub normalizer: Normalizer,
    pub memory: MemoryStore,
    pub transcript: TranscriptRecorder,
    pub orchestrator: Orchestrator,
    pub composer: ResponseComposer,
    pub accounts: Arc<LinkedAccounts>,
}

pub struct Pipeline {
    config: CoreConfig,
    deps: PipelineDeps,
    /// One lane per sender; a turn holds its lane for its full duration.
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Cancel tokens for in-flight turns, by sender.
    in_flight: Mutex<HashMap<String, CancelToken>>,
}

impl Pipeline {
    pub fn new(config: CoreConfig, deps: PipelineDeps) -> Self {
        Self {
            config,
            deps,
            lanes: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one inbound event to a finished reply.
    pub async fn handle_inbound(&self, event: InboundEvent) -> Result<ComposedReply, Error> {
        if let InboundPayload::Register { code } = &event.payload {
            return Ok(self.handle_register(&event, code).await);
        }

        // Admission precedes everything with a cost.
        let identity = match self.deps.gate.check(&event.sender).await? {
            Admission::Allowed(identity) => identity,
            Admission::DeniedUnregistered => {
                return Ok(ComposedReply::Text(
                    "This assistant is invite-only. Send your invite code to register.".into(),
                ));
            }
            Admission::DeniedBlocked => {
                return Ok(ComposedReply::Text("Your access has been revoked.".into()));
            }
        };

        let lane = self.lane_for(&event.sender).await;
        let _turn_guard = lane.lock().await;

        match event.payload {
            InboundPayload::Message(raw) => {
                self.handle_message(&event.sender, identity.id, identity.voice_enabled, raw)
                    .await
            }
            InboundPayload::Unlink => {
                let existed = self.deps.accounts.unlink(identity.id).await?;
                let text = if existed {
                    "Your workspace account has been unlinked."
                } else {
                    "No workspace account is linked."
                };
                self.deps
                    .transcript
                    .record_outbound_text(identity.id, text)
                    .await;
                Ok(ComposedReply::Text(text.into()))
            }
            InboundPayload::Register { .. } => unreachable!("handled above"),
        }
    }

    /// Cancel the sender's in-flight turn, if any. Returns whether one was
    /// found. The turn unwinds at its next iteration boundary.
    pub async fn cancel(&self, sender: &str) -> bool {
        match self.in_flight.lock().await.get(sender) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn handle_register(&self, event: &InboundEvent, code: &str) -> ComposedReply {
        match self
            .deps
            .gate
            .register(&event.sender, event.display_name.as_deref(), code)
            .await
        {
            Ok(Registration::Consumed(identity)) => {
                let name = identity.display_name.as_deref().unwrap_or("there");
                ComposedReply::Text(format!(
                    "Welcome, {name}! You're registered. Ask me anything, or link \
                     your workspace account to use mail and calendar tools."
                ))
            }
            Err(AdmissionError::AlreadyRegistered(_)) => {
                ComposedReply::Text("You're already registered.".into())
            }
            Err(AdmissionError::InvalidInvite) => {
                ComposedReply::Text("That invite code is invalid or already used.".into())
            }
            Err(e) => {
                error!(sender = %event.sender, "Registration failed: {e}");
                ComposedReply::Text("Registration failed, please try again later.".into())
            }
        }
    }

    async fn handle_message(
        &self,
        sender: &str,
        user_id: i64,
        voice_enabled: bool,
        raw: RawPayload,
    ) -> Result<ComposedReply, Error> {
        // Normalization rejects oversized or unsupported payloads before any
        // model cost.
        let units = match self.deps.normalizer.normalize(raw).await {
            Ok(units) => units,
            Err(e) => {
                let text = ingest_reply(&e);
                self.deps.transcript.record_outbound_text(user_id, &text).await;
                return Ok(ComposedReply::Text(text));
            }
        };

        let query = query_text(&units);

        // History excludes the current message; the inbound rows land right
        // after, before orchestration starts.
        let history = self
            .deps
            .transcript
            .history(user_id, self.config.history_window)
            .await;
        self.deps.transcript.record_inbound(user_id, &units).await;

        let memory = self.deps.memory.retrieve(user_id, &query).await;

        let cancel = CancelToken::new();
        self.in_flight
            .lock()
            .await
            .insert(sender.to_string(), cancel.clone());

        let turn = self
            .deps
            .orchestrator
            .run_turn(TurnInput {
                user_id,
                memory,
                history,
                parts: units_to_parts(&units),
                cancel,
            })
            .await;

        self.in_flight.lock().await.remove(sender);

        match turn {
            Ok(outcome) => {
                let reply = self
                    .deps
                    .composer
                    .compose(outcome.reply, voice_enabled)
                    .await;
                self.deps.transcript.record_outbound(user_id, &reply).await;
                if !query.is_empty() {
                    self.deps
                        .memory
                        .record_exchange(user_id, &query, reply.text());
                }
                Ok(reply)
            }
            Err(OrchestratorError::Cancelled) => {
                info!(user_id, "Turn cancelled by user");
                let text = "Cancelled.";
                self.deps.transcript.record_outbound_text(user_id, text).await;
                Ok(ComposedReply::Text(text.into()))
            }
            Err(e) => {
                error!(user_id, "Turn failed: {e}");
                let text = "Sorry, something went wrong handling that. Please try again.";
                self.deps.transcript.record_outbound_text(user_id, text).await;
                Ok(ComposedReply::Text(text.into()))
            }
        }
    }

    async fn lane_for(&self, sender: &str) -> Arc<Mutex<()>> {
        let mut lanes = self.lanes.lock().await;
        Arc::clone(lanes.entry(sender.to_string()).or_default())
    }
}

/// Text content of the current message, for memory retrieval and storage.
fn query_text(units: &[ContentUnit]) -> String {
    units
        .iter()
        .filter_map(|unit| match unit {
            ContentUnit::Text(text) => Some(text.as_str()),
            ContentUnit::UrlReference { url, .. } => Some(url.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn ingest_reply(e: &IngestError) -> String {
    match e {
        IngestError::PayloadTooLarge { size, limit } => format!(
            "That attachment is too large ({size} bytes, the limit is {limit}). \
             Please send something smaller."
        ),
        IngestError::UnsupportedMedia(mime) => {
            format!("I can't process that kind of attachment ({mime}).")
        }
        IngestError::Empty => "I received an empty message.".to_string(),
    }
}
