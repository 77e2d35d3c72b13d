use std::sync::Arc;

use clap::{Arg, Command};

use ragway_runtime::bulk::{ExportManager, JobStore};
use ragway_runtime::engines::{OllamaEmbedder, OllamaGenerator, QdrantIndex};
use ragway_runtime::tools::{PolicyStore, ToolExecutor};
use ragway_runtime::{AppState, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; real deployments configure the environment directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("ragway")
        .version(VERSION)
        .about("Multi-tenant retrieval-augmented question-answering gateway")
        .subcommand(
            Command::new("serve").about("Start the gateway").arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("HTTP listen port (overrides API_PORT)"),
            ),
        )
        .get_matches();

    let mut settings = Settings::from_env();
    if let Some(("serve", serve_matches)) = matches.subcommand() {
        if let Some(port) = serve_matches.get_one::<String>("port") {
            settings.api_port = port.parse()?;
        }
    }

    let generator = OllamaGenerator::new(
        &settings.ollama_url,
        &settings.ollama_model,
        settings.ollama_keep_alive.clone(),
        settings.generate_timeout,
    )
    .map_err(|e| anyhow::anyhow!("failed to build generator client: {e}"))?;
    let embedder = OllamaEmbedder::new(
        &settings.ollama_url,
        settings.embed_model(),
        settings.embed_timeout,
    )
    .map_err(|e| anyhow::anyhow!("failed to build embedder client: {e}"))?;
    let index = QdrantIndex::new(&settings.qdrant_url);

    let jobs = Arc::new(JobStore::connect(settings.redis_url.as_deref()).await);
    let exports = ExportManager::new(
        jobs,
        settings.export_max_concurrency,
        settings.download_max_concurrency,
        settings.export_ttl,
    );

    let state = AppState {
        policies: Arc::new(PolicyStore::new(settings.tools_policy_file.clone())),
        settings: Arc::new(settings),
        generator: Arc::new(generator),
        embedder: Arc::new(embedder),
        index: Arc::new(index),
        tools: Arc::new(ToolExecutor::new()),
        exports,
    };

    ragway_runtime::api::serve(state).await
}
