//! Multimodal normalizer — raw inbound units to typed, model-ready content.
//!
//! Oversized attachments and unknown media types are rejected here, before
//! any model cost. Bare URLs are dereferenced through a content-extraction
//! collaborator, failing open to the raw URL.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use crate::error::IngestError;

/// Raw inbound payload as delivered by the chat transport.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Text(String),
    Attachment {
        bytes: Vec<u8>,
        mime: String,
        file_name: Option<String>,
        /// Caption accompanying the attachment, if any.
        caption: Option<String>,
    },
}

/// A typed content unit consumable by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentUnit {
    Text(String),
    Image { bytes: Vec<u8>, mime: String },
    Document {
        bytes: Vec<u8>,
        mime: String,
        file_name: String,
    },
    Audio { bytes: Vec<u8>, mime: String },
    Video { bytes: Vec<u8>, mime: String },
    /// A bare URL, with extracted page text when the extractor succeeded.
    UrlReference { url: String, extracted: Option<String> },
}

impl ContentUnit {
    /// Content-type tag used in the transcript.
    pub fn kind(&self) -> &'static str {
        match self {
            ContentUnit::Text(_) => "text",
            ContentUnit::Image { .. } => "image",
            ContentUnit::Document { .. } => "document",
            ContentUnit::Audio { .. } => "audio",
            ContentUnit::Video { .. } => "video",
            ContentUnit::UrlReference { .. } => "url",
        }
    }

    /// Human-readable summary for transcript storage.
    pub fn transcript_content(&self) -> String {
        match self {
            ContentUnit::Text(t) => t.clone(),
            ContentUnit::Image { bytes, .. } => format!("[image, {} bytes]", bytes.len()),
            ContentUnit::Document { file_name, bytes, .. } => {
                format!("[document {file_name}, {} bytes]", bytes.len())
            }
            ContentUnit::Audio { bytes, .. } => format!("[audio, {} bytes]", bytes.len()),
            ContentUnit::Video { bytes, .. } => format!("[video, {} bytes]", bytes.len()),
            ContentUnit::UrlReference { url, .. } => url.clone(),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match self {
            ContentUnit::Document { file_name, .. } => Some(file_name),
            _ => None,
        }
    }
}

/// External web content-extraction collaborator.
#[async_trait]
pub trait WebExtractor: Send + Sync {
    /// Extract readable text from a page.
    async fn extract(&self, url: &str) -> Result<String, String>;
}

/// Reader-proxy extractor: prepends a reader endpoint to the target URL and
/// fetches plain text.
pub struct ReaderProxyExtractor {
    client: reqwest::Client,
    reader_base: String,
    timeout: Duration,
}

impl ReaderProxyExtractor {
    pub fn new(reader_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            reader_base: reader_base.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for ReaderProxyExtractor {
    fn default() -> Self {
        Self::new("https://r.jina.ai/")
    }
}

#[async_trait]
impl WebExtractor for ReaderProxyExtractor {
    async fn extract(&self, url: &str) -> Result<String, String> {
        let proxied = format!("{}{}", self.reader_base, url);
        let response = self
            .client
            .get(&proxied)
            .header("Accept", "text/plain")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("extractor returned {}", response.status()));
        }
        response.text().await.map_err(|e| e.to_string())
    }
}

const SUPPORTED_IMAGE: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const SUPPORTED_DOCUMENT: &[&str] = &[
    "application/pdf",
    "text/plain",
    "text/csv",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

/// Normalizes raw transport payloads into content units.
pub struct Normalizer {
    extractor: Arc<dyn WebExtractor>,
    max_attachment_bytes: usize,
    url_content_limit: usize,
}

impl Normalizer {
    pub fn new(
        extractor: Arc<dyn WebExtractor>,
        max_attachment_bytes: usize,
        url_content_limit: usize,
    ) -> Self {
        Self {
            extractor,
            max_attachment_bytes,
            url_content_limit,
        }
    }

    /// Normalize one raw payload into typed content units.
    ///
    /// A text payload that is a bare URL becomes a `UrlReference`; extraction
    /// failure falls back to the raw URL, never aborting the turn.
    pub async fn normalize(&self, raw: RawPayload) -> Result<Vec<ContentUnit>, IngestError> {
        match raw {
            RawPayload::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err(IngestError::Empty);
                }
                if is_bare_url(trimmed) {
                    return Ok(vec![self.resolve_url(trimmed).await]);
                }
                Ok(vec![ContentUnit::Text(trimmed.to_string())])
            }
            RawPayload::Attachment {
                bytes,
                mime,
                file_name,
                caption,
            } => {
                if bytes.len() > self.max_attachment_bytes {
                    return Err(IngestError::PayloadTooLarge {
                        size: bytes.len(),
                        limit: self.max_attachment_bytes,
                    });
                }

                let unit = self.classify(bytes, &mime, file_name)?;
                let mut units = Vec::with_capacity(2);
                if let Some(caption) = caption.filter(|c| !c.trim().is_empty()) {
                    units.push(ContentUnit::Text(caption.trim().to_string()));
                }
                units.push(unit);
                Ok(units)
            }
        }
    }

    fn classify(
        &self,
        bytes: Vec<u8>,
        mime: &str,
        file_name: Option<String>,
    ) -> Result<ContentUnit, IngestError> {
        let mime = normalize_mime(mime);
        if SUPPORTED_IMAGE.contains(&mime.as_str()) {
            return Ok(ContentUnit::Image { bytes, mime });
        }
        if mime.starts_with("audio/") {
            return Ok(ContentUnit::Audio { bytes, mime });
        }
        if mime.starts_with("video/") {
            return Ok(ContentUnit::Video { bytes, mime });
        }
        if SUPPORTED_DOCUMENT.contains(&mime.as_str()) {
            let file_name = file_name.unwrap_or_else(|| "attachment".to_string());
            return Ok(ContentUnit::Document {
                bytes,
                mime,
                file_name,
            });
        }
        Err(IngestError::UnsupportedMedia(mime))
    }

    async fn resolve_url(&self, url: &str) -> ContentUnit {
        match self.extractor.extract(url).await {
            Ok(text) if !text.trim().is_empty() => {
                let mut text = text;
                if text.len() > self.url_content_limit {
                    truncate_to_boundary(&mut text, self.url_content_limit);
                    text.push_str("\n\n... [content truncated]");
                }
                ContentUnit::UrlReference {
                    url: url.to_string(),
                    extracted: Some(text),
                }
            }
            Ok(_) => ContentUnit::UrlReference {
                url: url.to_string(),
                extracted: None,
            },
            Err(e) => {
                warn!(url, "Content extraction failed, passing raw URL: {e}");
                ContentUnit::UrlReference {
                    url: url.to_string(),
                    extracted: None,
                }
            }
        }
    }
}

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://\S+$").expect("static pattern"));

/// A message that consists of exactly one http(s) URL and nothing else.
fn is_bare_url(text: &str) -> bool {
    BARE_URL.is_match(text)
}

/// Cut a string to at most `limit` bytes without splitting a character.
/// `String::truncate` panics mid-character, and extracted web text is
/// routinely non-ASCII.
pub(crate) fn truncate_to_boundary(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Telegram-style mime fixups: `jpg` → `jpeg`, strip parameters.
fn normalize_mime(mime: &str) -> String {
    let mime = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    if mime == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        mime
    }
}
