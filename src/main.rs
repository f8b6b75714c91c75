//! colloquy - conversation orchestration service
//!
//! Accepts user utterances (typed or spoken), obtains replies from an LLM
//! provider and keeps an ordered, gap-free turn history per conversation.

mod analytics;
mod api;
mod db;
mod llm;
mod runtime;
mod state_machine;
mod voice;

use analytics::{AnalyticsSink, ChannelSink, TracingSink};
use api::{create_router, AppState};
use db::Database;
use llm::{LlmConfig, ModelRegistry};
use runtime::{DatabaseStore, Orchestrator, OrchestratorConfig, RegistryReplyGenerator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice::{OpenAiVoice, VoiceConfig};

const ANALYTICS_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "colloquy=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("COLLOQUY_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.colloquy/colloquy.db")
    });

    let port: u16 = std::env::var("COLLOQUY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // Interrupted cycles are reported, never resumed
    let unanswered = db.list_unanswered_conversations()?;
    if !unanswered.is_empty() {
        tracing::warn!(
            count = unanswered.len(),
            conversations = ?unanswered,
            "Conversations awaiting a reply from a previous run"
        );
    }

    // Initialize LLM registry
    let llm_config = LlmConfig::from_env();
    let llm_registry = Arc::new(ModelRegistry::new(&llm_config));

    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM API keys configured. Set ANTHROPIC_API_KEY or OPENAI_API_KEY.");
    }

    let config = OrchestratorConfig::from_env();
    tracing::info!(
        context_turns = config.context_turns,
        provider_timeout_secs = config.provider_timeout.as_secs(),
        max_tokens = config.max_tokens,
        "Orchestrator configured"
    );

    // Analytics writer drains into the database until shutdown. Setting
    // COLLOQUY_ANALYTICS=log keeps events in the log stream only.
    let shutdown = CancellationToken::new();
    let (analytics, analytics_writer): (Arc<dyn AnalyticsSink>, _) =
        if std::env::var("COLLOQUY_ANALYTICS").as_deref() == Ok("log") {
            (Arc::new(TracingSink), None)
        } else {
            let (sink, writer) =
                ChannelSink::spawn(db.clone(), ANALYTICS_QUEUE_CAPACITY, shutdown.clone());
            (Arc::new(sink), Some(writer))
        };

    let generator = RegistryReplyGenerator::new(
        Arc::clone(&llm_registry),
        config.system_prompt.clone(),
        config.max_tokens,
    );
    let mut orchestrator = Orchestrator::new(
        DatabaseStore::new(db),
        generator,
        analytics,
        config,
    );

    let voice_config = VoiceConfig::from_env();
    match voice_config.api_key.clone() {
        Some(api_key) => match OpenAiVoice::new(api_key, voice_config) {
            Ok(voice) => {
                tracing::info!("Voice pipeline enabled");
                orchestrator = orchestrator.with_voice(Arc::new(voice));
            }
            Err(e) => tracing::warn!(error = %e, "Failed to initialize voice pipeline"),
        },
        None => tracing::info!("Voice pipeline disabled. Set OPENAI_API_KEY to enable."),
    }

    let state = AppState::new(orchestrator, llm_registry);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("colloquy server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(writer) = analytics_writer {
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "Analytics writer did not shut down cleanly");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
