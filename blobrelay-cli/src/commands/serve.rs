//! HTTP server command
//!
//! Runs the relay with every route. Stores come from the `[stores.*]`
//! config sections, or from in-process memory with `--memory`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use blobrelay_core::RelayConfig;
use blobrelay_server::{run_server, AppState, MemoryDirectory, PgDirectory, ServerConfig, StoreDirectory};
use clap::Parser;

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to bind to (overrides server.bind)
    #[arg(long, short = 'b')]
    pub bind: Option<SocketAddr>,

    /// Allow permissive CORS (all origins) - use with caution
    #[arg(long)]
    pub cors_permissive: bool,

    /// Serve from in-memory stores instead of PostgreSQL
    #[arg(long)]
    pub memory: bool,
}

/// Run the HTTP server
pub async fn run_serve(args: ServeArgs, config_path: Option<&Path>) -> Result<()> {
    let config = RelayConfig::load(config_path)?;

    let bind_addr = match args.bind {
        Some(addr) => addr,
        None => config
            .server
            .bind
            .parse()
            .context(format!("Invalid server.bind address: {}", config.server.bind))?,
    };
    let server_config = ServerConfig {
        bind_addr,
        cors_permissive: args.cors_permissive || config.server.cors_permissive,
    };

    if args.memory {
        let names: Vec<String> = if config.stores.is_empty() {
            vec!["main".to_string()]
        } else {
            config.stores.keys().cloned().collect()
        };
        tracing::warn!(stores = ?names, "serving from memory, nothing is persisted");
        serve(MemoryDirectory::new(names), &config, server_config).await
    } else {
        if config.stores.is_empty() {
            tracing::warn!("no [stores.*] configured, large-object routes will return 404");
        }
        let directory = PgDirectory::new(config.stores.clone());
        let state = AppState::start(directory, &config);
        spawn_reload_on_hangup(Arc::clone(&state), config_path.map(Path::to_path_buf));
        run(state, server_config).await
    }
}

async fn serve<D: StoreDirectory>(
    directory: D,
    config: &RelayConfig,
    server_config: ServerConfig,
) -> Result<()> {
    run(AppState::start(directory, config), server_config).await
}

async fn run<D: StoreDirectory>(state: Arc<AppState<D>>, server_config: ServerConfig) -> Result<()> {
    tracing::info!("Starting blobrelay on {}", server_config.bind_addr);

    // Run server (blocks until shutdown)
    run_server(state, server_config).await.context("Server error")?;

    Ok(())
}

/// Re-read the config on SIGHUP and swap the store catalog. Pools that are
/// already open stay open.
#[cfg(unix)]
fn spawn_reload_on_hangup<D: StoreDirectory>(state: Arc<AppState<D>>, config_path: Option<PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGHUP handler, reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match RelayConfig::load(config_path.as_deref()) {
                Ok(config) => state.stores.reload(&config.stores),
                Err(e) => tracing::error!(error = %e, "config reload failed, keeping current stores"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup<D: StoreDirectory>(_state: Arc<AppState<D>>, _config_path: Option<PathBuf>) {}
