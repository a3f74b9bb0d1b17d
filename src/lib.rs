//! Concierge — invite-gated AI assistant core.
//!
//! Receives inbound chat events, admits or denies the sender, normalizes
//! multimodal content, runs a tool-calling loop against an LLM enriched with
//! long-term memory, and composes a text or voice reply. Every exchange is
//! recorded to an append-only transcript.

pub mod accounts;
pub mod agent;
pub mod compose;
pub mod config;
pub mod error;
pub mod gate;
pub mod ingest;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod store;
pub mod tools;
pub mod transcript;
