use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use concierge::accounts::{HttpTokenRefresher, LinkedAccounts, TokenRefresher};
use concierge::agent::{Orchestrator, OrchestratorDeps};
use concierge::compose::{ComposedReply, ElevenLabsSynthesizer, ResponseComposer, SpeechSynthesizer};
use concierge::config::{CoreConfig, ModelConfig, OAuthConfig, VoiceConfig};
use concierge::error::AccountError;
use concierge::gate::AdmissionGate;
use concierge::ingest::{Normalizer, RawPayload, ReaderProxyExtractor, WebExtractor};
use concierge::llm::GeminiClient;
use concierge::memory::{MemoryParams, MemoryStore};
use concierge::pipeline::{InboundEvent, InboundPayload, Pipeline, PipelineDeps};
use concierge::store::{Database, LibSqlBackend};
use concierge::tools::chart::QuickChartRenderer;
use concierge::tools::gateway::HttpWorkspaceClient;
use concierge::transcript::TranscriptRecorder;

/// Stands in when the delegated-authorization client is not configured:
/// every refresh fails, so tools report the account as unusable instead of
/// silently hitting the API with dead tokens.
struct DisabledRefresher;

#[async_trait::async_trait]
impl TokenRefresher for DisabledRefresher {
    async fn refresh(
        &self,
        _refresh_token: &str,
    ) -> Result<concierge::accounts::RefreshedToken, AccountError> {
        Err(AccountError::RefreshFailed(
            "workspace OAuth client is not configured".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let model_config = ModelConfig::from_env()?;
    let core_config = CoreConfig::default();

    let db_path =
        std::env::var("CONCIERGE_DB_PATH").unwrap_or_else(|_| "./data/concierge.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path)).await?,
    );

    eprintln!("Concierge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model_config.model);
    eprintln!("   Database: {db_path}");

    let gemini = Arc::new(GeminiClient::new(&model_config));

    let refresher: Arc<dyn TokenRefresher> = match OAuthConfig::from_env() {
        Some(oauth) => {
            eprintln!("   Workspace OAuth: configured");
            Arc::new(HttpTokenRefresher::new(oauth))
        }
        None => {
            eprintln!("   Workspace OAuth: not configured (tools will report unlinked)");
            Arc::new(DisabledRefresher)
        }
    };
    let accounts = Arc::new(LinkedAccounts::new(Arc::clone(&db), refresher));

    let synthesizer: Option<Arc<dyn SpeechSynthesizer>> = match VoiceConfig::from_env() {
        Some(voice) => {
            eprintln!("   Voice replies: enabled");
            Some(Arc::new(ElevenLabsSynthesizer::new(voice)))
        }
        None => {
            eprintln!("   Voice replies: disabled");
            None
        }
    };

    let extractor: Arc<dyn WebExtractor> = Arc::new(ReaderProxyExtractor::default());
    let registry = concierge::tools::standard_registry(
        Arc::clone(&accounts),
        Arc::new(HttpWorkspaceClient::new()),
        Arc::new(QuickChartRenderer::new()),
        Arc::clone(&extractor),
        core_config.url_content_limit,
    )
    .await?;
    eprintln!("   Tools: {} registered", registry.count());

    let gate = AdmissionGate::new(Arc::clone(&db));
    let pipeline = Arc::new(Pipeline::new(
        core_config.clone(),
        PipelineDeps {
            gate,
            normalizer: Normalizer::new(
                Arc::clone(&extractor),
                core_config.max_attachment_bytes,
                core_config.url_content_limit,
            ),
            memory: MemoryStore::new(
                Arc::clone(&db),
                gemini.clone(),
                MemoryParams {
                    top_k: core_config.memory_top_k,
                    min_similarity: core_config.memory_min_similarity,
                    max_age_days: core_config.memory_max_age_days,
                    timeout: core_config.memory_timeout,
                },
            ),
            transcript: TranscriptRecorder::new(Arc::clone(&db)),
            orchestrator: Orchestrator::new(
                core_config.clone(),
                OrchestratorDeps {
                    llm: gemini,
                    tools: Arc::new(registry),
                },
            ),
            composer: ResponseComposer::new(
                synthesizer,
                core_config.voice_max_words,
                core_config.synthesis_timeout,
            ),
            accounts,
        },
    ));

    // Mint a first invite when the invite table is empty, so a fresh install
    // has a way in.
    let gate = AdmissionGate::new(Arc::clone(&db));
    if db.count_invites().await? == 0 {
        let code = gate.mint_invite(Some("local operator")).await?;
        eprintln!("   First run: register with '/register {code}'");
    }

    eprintln!("\nType a message, '/register CODE', '/unlink', '/cancel', or '/quit'.\n");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/cancel" {
            let cancelled = pipeline.cancel("cli:local").await;
            eprintln!("{}", if cancelled { "Cancelling." } else { "Nothing in flight." });
            continue;
        }

        let payload = if let Some(code) = line.strip_prefix("/register ") {
            InboundPayload::Register {
                code: code.trim().to_string(),
            }
        } else if line == "/unlink" {
            InboundPayload::Unlink
        } else {
            InboundPayload::Message(RawPayload::Text(line))
        };

        let event = InboundEvent {
            sender: "cli:local".to_string(),
            display_name: Some("operator".to_string()),
            payload,
        };
        match pipeline.handle_inbound(event).await {
            Ok(ComposedReply::Text(text)) => println!("{text}"),
            Ok(ComposedReply::VoiceFallback(text)) => {
                println!("(voice unavailable) {text}")
            }
            Ok(ComposedReply::Voice { transcript, audio, .. }) => {
                println!("[voice note, {} bytes] {transcript}", audio.len())
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    Ok(())
}
