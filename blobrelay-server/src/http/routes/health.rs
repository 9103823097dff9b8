//! Health check endpoint

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::db::PoolStats;
use crate::directory::StoreDirectory;
use crate::http::server::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub registered_streams: usize,
    pub stores: Vec<String>,
    pub pools: Vec<PoolStats>,
}

/// GET /health
async fn health<D: StoreDirectory>(State(state): State<Arc<AppState<D>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        registered_streams: state.registry.len(),
        stores: state.stores.names(),
        pools: state.stores.pool_stats(),
    })
}

/// Health routes
pub fn router<D: StoreDirectory>() -> Router<Arc<AppState<D>>> {
    Router::new().route("/health", get(health::<D>))
}
