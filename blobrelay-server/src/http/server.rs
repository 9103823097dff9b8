//! Axum server setup
//!
//! Server skeleton with:
//! - Localhost-only CORS by default
//! - Tracing middleware
//! - Graceful shutdown on SIGTERM/Ctrl+C, then pool drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use axum::Router;
use blobrelay_core::config::FilesSection;
use blobrelay_core::{RelayConfig, StreamRegistry, TransferConfig};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::routes;
use crate::directory::StoreDirectory;
use crate::handoff::{self, HandoffQueue};

/// Pending handoff jobs before the multipart route waits
const HANDOFF_QUEUE_DEPTH: usize = 32;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:1880)
    pub bind_addr: SocketAddr,

    /// Allow permissive CORS (default: false = localhost only)
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1880)),
            cors_permissive: false,
        }
    }
}

/// Shared application state
pub struct AppState<D> {
    pub stores: D,
    pub registry: Arc<StreamRegistry>,
    pub transfer: TransferConfig,
    pub files: FilesSection,
    pub handoff: HandoffQueue,
}

impl<D: StoreDirectory> AppState<D> {
    /// Build the state and start its background tasks: the registry
    /// sweeper and the handoff worker.
    pub fn start(stores: D, config: &RelayConfig) -> Arc<Self> {
        let registry = Arc::new(StreamRegistry::new(config.registry_config()));
        registry.spawn_sweeper(Duration::from_secs(config.registry.sweep_interval_secs.max(1)));

        let (queue, jobs) = HandoffQueue::new(HANDOFF_QUEUE_DEPTH);
        let state = Arc::new(Self {
            stores,
            registry,
            transfer: config.transfer_config(),
            files: config.files.clone(),
            handoff: queue,
        });
        handoff::spawn_worker(Arc::clone(&state), jobs);
        state
    }
}

/// Build the application router with all routes
pub fn build_router<D: StoreDirectory>(state: Arc<AppState<D>>, cors_permissive: bool) -> Router {
    let cors = if cors_permissive {
        tracing::warn!("CORS: Permissive mode enabled - all origins allowed");
        CorsLayer::permissive()
    } else {
        // Localhost only
        CorsLayer::new()
            .allow_origin([
                HeaderValue::from_static("http://localhost:1880"),
                HeaderValue::from_static("http://127.0.0.1:1880"),
            ])
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .merge(routes::health::router())
        .merge(routes::large_objects::router())
        .merge(routes::files::router())
        .merge(routes::upload_stream::router())
        // uploads are streamed, never buffered whole
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until a shutdown signal, then drain the pools.
///
/// # Example
///
/// ```ignore
/// let state = AppState::start(PgDirectory::new(config.stores.clone()), &config);
/// run_server(state, ServerConfig::default()).await?;
/// ```
pub async fn run_server<D: StoreDirectory>(
    state: Arc<AppState<D>>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let app = build_router(Arc::clone(&state), config.cors_permissive);

    // Bind listener
    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    // Run with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.stores.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting shutdown");
        }
    }
}

/// Server error type
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
