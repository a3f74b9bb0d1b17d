//! Response composition — text or synthesized voice.
//!
//! Voice is an enhancement, never a requirement: any synthesis failure or
//! timeout degrades to the text reply, flagged so the transport can tell the
//! user the voice note didn't come through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::warn;

use crate::config::VoiceConfig;

/// A reply ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposedReply {
    Text(String),
    Voice {
        audio: Vec<u8>,
        mime: String,
        /// The spoken text, kept for the transcript.
        transcript: String,
    },
    /// Voice was attempted but synthesis failed; carries the text reply.
    VoiceFallback(String),
}

impl ComposedReply {
    /// The textual content regardless of delivery form.
    pub fn text(&self) -> &str {
        match self {
            ComposedReply::Text(text) | ComposedReply::VoiceFallback(text) => text,
            ComposedReply::Voice { transcript, .. } => transcript,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Text-to-speech collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, String>;
}

/// ElevenLabs text-to-speech client.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: VoiceConfig,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, String> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.config.voice_id
        );
        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.config.api_key.expose_secret())
            .json(&serde_json::json!({
                "text": text,
                "model_id": "eleven_multilingual_v2"
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("synthesis returned {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            mime: "audio/mpeg".to_string(),
        })
    }
}

pub struct ResponseComposer {
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    voice_max_words: usize,
    synthesis_timeout: Duration,
}

impl ResponseComposer {
    pub fn new(
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        voice_max_words: usize,
        synthesis_timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            voice_max_words,
            synthesis_timeout,
        }
    }

    /// Compose the outbound reply for one turn.
    pub async fn compose(&self, text: String, voice_enabled: bool) -> ComposedReply {
        let Some(synthesizer) = &self.synthesizer else {
            return ComposedReply::Text(text);
        };
        if !voice_enabled || !voice_eligible(&text, self.voice_max_words) {
            return ComposedReply::Text(text);
        }

        match tokio::time::timeout(self.synthesis_timeout, synthesizer.synthesize(&text)).await {
            Ok(Ok(audio)) => ComposedReply::Voice {
                audio: audio.bytes,
                mime: audio.mime,
                transcript: text,
            },
            Ok(Err(e)) => {
                warn!("Speech synthesis failed, falling back to text: {e}");
                ComposedReply::VoiceFallback(text)
            }
            Err(_) => {
                warn!("Speech synthesis timed out, falling back to text");
                ComposedReply::VoiceFallback(text)
            }
        }
    }
}

/// Whether a reply reads well aloud: short, conversational English prose.
/// Data-heavy replies (numbers, lists, links, currency) stay textual so the
/// user can copy and reread them.
pub fn voice_eligible(text: &str, max_words: usize) -> bool {
    let words = text.split_whitespace().count();
    if words == 0 || words > max_words {
        return false;
    }
    if text.contains("http://") || text.contains("https://") {
        return false;
    }
    if text.contains(['$', '€', '£', '¥', '%', '@']) {
        return false;
    }
    // Bullet or numbered lists.
    if text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("- ")
            || line.starts_with("* ")
            || line
                .split_once(". ")
                .is_some_and(|(head, _)| head.chars().all(|c| c.is_ascii_digit()) && !head.is_empty())
    }) {
        return false;
    }

    let total = text.chars().count();
    let digits = text.chars().filter(char::is_ascii_digit).count();
    if digits * 5 > total {
        return false;
    }
    // Mostly-CJK replies are out of the synthesis voice's range.
    let cjk = text
        .chars()
        .filter(|c| matches!(*c, '\u{4e00}'..='\u{9fff}' | '\u{3040}'..='\u{30ff}' | '\u{ac00}'..='\u{d7af}'))
        .count();
    if cjk * 10 > total {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSynth(Result<SynthesizedAudio, String>);

    #[async_trait]
    impl SpeechSynthesizer for FixedSynth {
        async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio, String> {
            self.0.clone()
        }
    }

    fn composer(synth: Option<FixedSynth>) -> ResponseComposer {
        ResponseComposer::new(
            synth.map(|s| Arc::new(s) as Arc<dyn SpeechSynthesizer>),
            30,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn eligibility_heuristic() {
        assert!(voice_eligible("Sure, I'll handle that right away.", 30));
        // Too long.
        let long = "word ".repeat(40);
        assert!(!voice_eligible(&long, 30));
        // Links, currency, lists, number-heavy and CJK all stay textual.
        assert!(!voice_eligible("See https://example.com for details", 30));
        assert!(!voice_eligible("The total is $42.50", 30));
        assert!(!voice_eligible("Options:\n- first\n- second", 30));
        assert!(!voice_eligible("1. do this\n2. then that", 30));
        assert!(!voice_eligible("Call 0712 345 678 ext 9901 now 442", 30));
        assert!(!voice_eligible("好的，我马上安排会议。", 30));
        assert!(!voice_eligible("", 30));
    }

    #[tokio::test]
    async fn voice_disabled_user_gets_text() {
        let composer = composer(Some(FixedSynth(Ok(SynthesizedAudio {
            bytes: vec![1],
            mime: "audio/mpeg".into(),
        }))));
        let reply = composer.compose("Short reply.".into(), false).await;
        assert_eq!(reply, ComposedReply::Text("Short reply.".into()));
    }

    #[tokio::test]
    async fn eligible_reply_is_synthesized() {
        let composer = composer(Some(FixedSynth(Ok(SynthesizedAudio {
            bytes: vec![1, 2, 3],
            mime: "audio/mpeg".into(),
        }))));
        match composer.compose("On it.".into(), true).await {
            ComposedReply::Voice {
                audio, transcript, ..
            } => {
                assert_eq!(audio, vec![1, 2, 3]);
                assert_eq!(transcript, "On it.");
            }
            other => panic!("expected Voice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn synthesis_failure_falls_back_visibly() {
        let composer = composer(Some(FixedSynth(Err("quota exceeded".into()))));
        let reply = composer.compose("On it.".into(), true).await;
        assert_eq!(reply, ComposedReply::VoiceFallback("On it.".into()));
        assert_eq!(reply.text(), "On it.");
    }

    #[tokio::test]
    async fn no_synthesizer_means_plain_text() {
        let composer = composer(None);
        let reply = composer.compose("On it.".into(), true).await;
        assert_eq!(reply, ComposedReply::Text("On it.".into()));
    }
}
