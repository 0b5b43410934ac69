use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imgpress_core::{
    load_config, validate_config, ConversionService, Converter, FsObjectStore, ImageEncoder,
    MetadataStore, ProgressTracker, SqliteMetadataStore, WebpEncoder,
};
use imgpress_server::api::create_router;
use imgpress_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be initialized if config loading failed
        eprintln!("Fatal error: {:#}", e);
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("IMGPRESS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration before logging so the format can follow it
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(config.logging.json);
    info!(version = VERSION, "Starting imgpress");
    info!("Configuration loaded from {:?}", config_path);

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Storage root: {:?}", config.storage.root);
    info!("Database path: {:?}", config.database.path);

    std::fs::create_dir_all(&config.storage.root)
        .with_context(|| format!("Failed to create storage root {:?}", config.storage.root))?;

    // Create metadata store
    let metadata: Arc<dyn MetadataStore> = Arc::new(
        SqliteMetadataStore::new(&config.database.path)
            .context("Failed to open metadata database")?,
    );

    // Create converter
    let store = FsObjectStore::new(config.storage.root.clone());
    let encoder = WebpEncoder::new();
    let progress = ProgressTracker::new(config.converter.progress_queue_capacity);
    info!(
        encoder = encoder.name(),
        target = encoder.target_extension(),
        "Image encoder ready"
    );

    let converter = Arc::new(
        Converter::new(config.converter.clone(), store, encoder).with_progress(progress.clone()),
    );
    converter.start();
    info!(
        workers = converter.status().workers,
        queue_capacity = config.converter.queue_capacity,
        "Converter started"
    );

    let service = Arc::new(ConversionService::new(Arc::clone(&converter), metadata));
    let state = Arc::new(AppState::new(config.clone(), service, progress));

    // Create router
    let app = create_router(Arc::clone(&state));

    // Start server
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop background jobs, then the pool
    info!("Server shutting down...");
    state.shutdown_token().cancel();
    converter.shutdown().await;
    info!("Converter stopped");

    Ok(())
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
