//! Agent orchestration — the bounded model/tool loop.

pub mod orchestrator;

pub use orchestrator::{Orchestrator, OrchestratorDeps, TurnOutcome};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ingest::ContentUnit;
use crate::llm::MessagePart;

/// Cooperative cancellation handle for an in-flight turn.
///
/// Checked at loop iteration boundaries; a tool already dispatched runs to
/// completion, but its result is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Convert normalized content units into model message parts.
pub fn units_to_parts(units: &[ContentUnit]) -> Vec<MessagePart> {
    units
        .iter()
        .map(|unit| match unit {
            ContentUnit::Text(text) => MessagePart::Text(text.clone()),
            ContentUnit::Image { bytes, mime }
            | ContentUnit::Audio { bytes, mime }
            | ContentUnit::Video { bytes, mime } => MessagePart::InlineData {
                mime: mime.clone(),
                data: bytes.clone(),
            },
            ContentUnit::Document { bytes, mime, .. } => MessagePart::InlineData {
                mime: mime.clone(),
                data: bytes.clone(),
            },
            ContentUnit::UrlReference { url, extracted } => match extracted {
                Some(text) => MessagePart::Text(format!("Content of {url}:\n\n{text}")),
                None => MessagePart::Text(url.clone()),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn url_with_extraction_becomes_inline_text() {
        let parts = units_to_parts(&[ContentUnit::UrlReference {
            url: "https://example.com".into(),
            extracted: Some("Body".into()),
        }]);
        match &parts[0] {
            MessagePart::Text(text) => {
                assert!(text.contains("https://example.com"));
                assert!(text.contains("Body"));
            }
            other => panic!("expected Text, got {other:?}"),
        }
    }
}
