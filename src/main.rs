use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cas_server::{api, config::Config, AppState};

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

    info!(version = env!("CARGO_PKG_VERSION"), "cas-server starting");

    // Load configuration
    let config = Config::load()?;
    info!(
        channels = config.channels.len(),
        "Loaded configuration for storage: {}",
        config.storage.storage_dir.display()
    );

    // Open object stores, index database and indexer
    let state = Arc::new(AppState::open(config.clone())?);
    info!(
        "Index database opened at: {}",
        config.storage.index_db_dir().display()
    );

    // Start the background indexer
    let cancel = CancellationToken::new();
    let indexer_handle = if config.indexer.enabled {
        info!(
            interval_ms = config.indexer.interval_ms,
            "Indexing directory: {}",
            state.indexer.root().display()
        );
        Some(Arc::clone(&state.indexer).spawn(
            Duration::from_millis(config.indexer.interval_ms),
            cancel.clone(),
        ))
    } else {
        info!("Background indexing disabled");
        None
    };

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on: {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop the indexer once its current pass ends
    info!("Shutting down background tasks");
    cancel.cancel();
    if let Some(handle) = indexer_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Indexer task failed during shutdown");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
