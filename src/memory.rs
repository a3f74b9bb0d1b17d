//! Long-term memory over embedded conversation records.
//!
//! Retrieval is best-effort: any failure or timeout degrades to "no memory"
//! and the turn proceeds. Writes happen off the reply path and never delay
//! the response.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::llm::EmbeddingProvider;
use crate::store::{Database, MemoryRow};

/// Outcome of a retrieval pass.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryContext {
    /// Relevant records, most similar first.
    Found(Vec<String>),
    /// Nothing above the similarity floor.
    None,
    /// Retrieval failed or timed out; the turn runs without memory.
    Degraded,
}

impl MemoryContext {
    /// Render as a system-prompt block, or `None` when there is nothing to say.
    pub fn as_prompt_block(&self) -> Option<String> {
        match self {
            MemoryContext::Found(records) => Some(format!(
                "Relevant context from earlier conversations:\n{}",
                records
                    .iter()
                    .map(|r| format!("- {r}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )),
            MemoryContext::None | MemoryContext::Degraded => None,
        }
    }
}

/// Tuning knobs for retrieval, lifted from the core config.
#[derive(Debug, Clone)]
pub struct MemoryParams {
    pub top_k: usize,
    pub min_similarity: f32,
    pub max_age_days: i64,
    pub timeout: Duration,
}

/// Reply text longer than this is truncated before storage.
const STORED_REPLY_LIMIT: usize = 500;

/// Upper bound on candidate rows loaded per retrieval.
const CANDIDATE_LIMIT: usize = 512;

pub struct MemoryStore {
    db: Arc<dyn Database>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: MemoryParams,
}

impl MemoryStore {
    pub fn new(
        db: Arc<dyn Database>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: MemoryParams,
    ) -> Self {
        Self {
            db,
            embedder,
            params,
        }
    }

    /// Retrieve records relevant to `query` for one user.
    ///
    /// Only records newer than the staleness horizon participate. Failure and
    /// timeout both collapse to [`MemoryContext::Degraded`].
    pub async fn retrieve(&self, user_id: i64, query: &str) -> MemoryContext {
        match tokio::time::timeout(self.params.timeout, self.retrieve_inner(user_id, query)).await
        {
            Ok(Ok(context)) => context,
            Ok(Err(e)) => {
                warn!(user_id, "Memory retrieval failed, continuing without: {e}");
                MemoryContext::Degraded
            }
            Err(_) => {
                warn!(user_id, "Memory retrieval timed out, continuing without");
                MemoryContext::Degraded
            }
        }
    }

    async fn retrieve_inner(
        &self,
        user_id: i64,
        query: &str,
    ) -> Result<MemoryContext, anyhow::Error> {
        let query_embedding = self.embedder.embed(query).await?;
        let since = Utc::now() - ChronoDuration::days(self.params.max_age_days);
        let candidates = self.db.list_memories(user_id, since, CANDIDATE_LIMIT).await?;

        let mut scored: Vec<(f32, &MemoryRow)> = candidates
            .iter()
            .map(|row| (cosine_similarity(&query_embedding, &row.embedding), row))
            .filter(|(score, _)| *score >= self.params.min_similarity)
            .collect();

        // Most similar first; equal scores break toward the newer record.
        scored.sort_by(|(sa, ra), (sb, rb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(rb.created_at.cmp(&ra.created_at))
        });
        scored.truncate(self.params.top_k);

        if scored.is_empty() {
            return Ok(MemoryContext::None);
        }
        debug!(user_id, hits = scored.len(), "Memory retrieval hit");
        Ok(MemoryContext::Found(
            scored.into_iter().map(|(_, row)| row.content.clone()).collect(),
        ))
    }

    /// Store one exchange off the reply path. The spawned task owns its own
    /// handles; a failed write is logged and dropped.
    pub fn record_exchange(&self, user_id: i64, user_text: &str, reply_text: &str) {
        let content = exchange_record(user_text, reply_text);
        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        tokio::spawn(async move {
            if let Err(e) = write_record(db.as_ref(), embedder.as_ref(), user_id, content).await {
                warn!(user_id, "Failed to store memory record: {e}");
            }
        });
    }
}

async fn write_record(
    db: &dyn Database,
    embedder: &dyn EmbeddingProvider,
    user_id: i64,
    content: String,
) -> Result<(), anyhow::Error> {
    let embedding = embedder.embed(&content).await?;
    let row = MemoryRow {
        id: Uuid::new_v4().to_string(),
        user_id,
        content,
        embedding,
        created_at: Utc::now(),
    };
    db.insert_memory(&row).await?;
    Ok(())
}

/// Combined record text for one exchange. Long replies are cut; the question
/// carries most of the retrieval signal.
fn exchange_record(user_text: &str, reply_text: &str) -> String {
    let reply: String = if reply_text.chars().count() > STORED_REPLY_LIMIT {
        let cut: String = reply_text.chars().take(STORED_REPLY_LIMIT).collect();
        format!("{cut}...")
    } else {
        reply_text.to_string()
    };
    format!("User asked: {user_text}\nAssistant replied: {reply}")
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
