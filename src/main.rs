use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memearena::{
    catalog::{self, PromptCatalog},
    config::AppConfig,
    repository::{FileRepository, MemoryRepository, Repository},
    state::AppState,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memearena=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting memearena...");

    let config = AppConfig::from_env();

    let repo: Arc<dyn Repository> = match &config.data_file {
        Some(path) => match FileRepository::open(path).await {
            Ok(repo) => {
                tracing::info!("Persisting to {}", path.display());
                Arc::new(repo)
            }
            Err(e) => {
                tracing::error!("Failed to open store at {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::info!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryRepository::new())
        }
    };
    let prompt_catalog: Arc<dyn PromptCatalog> = Arc::from(catalog::from_config(&config));

    let addr = config.bind_addr;
    let state = Arc::new(AppState::new(config, repo, prompt_catalog));

    if let Err(e) = state.recover().await {
        tracing::error!("Startup recovery failed: {}", e);
    }

    let app = memearena::app(state);

    tracing::info!("Listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
