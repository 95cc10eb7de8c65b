use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_ingest::{
    api,
    config::Config,
    manager::FileManager,
    object_store::{self as obj, ObjectStore},
    processing::{ClamAvScanner, ProcessingPipeline},
    retention::RetentionSweeper,
    storage::Database,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-ingest starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize record store
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Initialize object store
    let store: Arc<dyn ObjectStore> = Arc::new(obj::LocalStore::new(&config.files.temp_dir)?);
    info!(
        storage_dir = %config.files.storage_dir.display(),
        temp_dir = %config.files.temp_dir.display(),
        "Using local storage"
    );

    // Processing stages
    let mut processing = ProcessingPipeline::new(Arc::clone(&store), &config.files);
    if config.files.virus_scan_enabled {
        processing = processing.with_scanner(Arc::new(ClamAvScanner::new(&config.scanner)));
        info!(
            host = %config.scanner.host,
            port = config.scanner.port,
            fail_closed = config.files.scan_fail_closed,
            "Virus scanning enabled"
        );
    }

    let manager = Arc::new(
        FileManager::new(config.files.clone(), store, Arc::new(db))?.with_processing(processing),
    );

    // Start the retention sweeper
    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::spawn(
        Arc::clone(&manager),
        config.files.cleanup_interval,
        shutdown.clone(),
    );

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        manager,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
    info!("Listening on: {}", config.node.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down background tasks");
    shutdown.cancel();
    sweeper.join().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, draining connections");
}
