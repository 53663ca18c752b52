//! Deploy Service
//!
//! REST API for deployments, backed by the deployment pipeline

use anyhow::{Context, Result};
use deploy_service::{create_router, AppState, Config, Storage, StoreMode};
use deployer::{
    ContainerEngine, DockerEngine, GitFetcher, MemorySink, MockEngine, Orchestrator, StatusSink,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_service=debug,deployer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Deploy Service");
    info!("Store mode: {:?}", config.store_mode);
    info!("Workspace root: {}", config.deployer.workspace_root.display());

    config.ensure_directories()?;

    let engine: Arc<dyn ContainerEngine> = if config.mock_engine {
        warn!("Using the in-memory container engine, nothing will actually run");
        Arc::new(MockEngine::new())
    } else {
        let docker = DockerEngine::connect(config.docker_socket.as_deref())
            .context("Failed to connect to Docker")?;
        if let Err(e) = docker.ping().await {
            warn!("Docker is not reachable yet: {}", e);
        }
        Arc::new(docker)
    };

    let (sink, records): (Arc<dyn StatusSink>, _) = match config.store_mode {
        StoreMode::Redis => {
            let storage = Storage::new(&config.redis_url)
                .await
                .context("Failed to initialize storage")?;
            let records = storage
                .load_all()
                .await
                .context("Failed to load deployments")?;
            (Arc::new(storage), records)
        }
        StoreMode::Memory => {
            warn!("Deployment records are kept in memory and lost on restart");
            (Arc::new(MemorySink::new()), Vec::new())
        }
    };

    let orchestrator = Orchestrator::new(
        engine,
        Arc::new(GitFetcher::new()),
        sink,
        config.deployer.clone(),
    );

    orchestrator
        .restore(records)
        .await
        .context("Failed to restore deployments")?;

    // Create router
    let app = create_router(AppState::new(orchestrator));

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Deploy Service API running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Deploy Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
