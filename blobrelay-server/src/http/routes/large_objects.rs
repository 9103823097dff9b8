//! Large-object endpoints
//!
//! - `GET /pg-download/{store}/{oid}` streams an object out
//! - `POST /pg-upload/{store}` streams the request body into a new object

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use blobrelay_core::{start_download, upload, DownloadHeaders, Oid, UploadReceipt};
use serde::Deserialize;
use tracing::info;

use super::{body_stream, request_content_type, stream_response};
use crate::directory::StoreDirectory;
use crate::http::error::ApiError;
use crate::http::server::AppState;

/// Optional response header overrides
#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub disposition: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub filename: Option<String>,
    pub mimetype: Option<String>,
}

/// GET /pg-download/{store}/{oid}
async fn download_object<D: StoreDirectory>(
    State(state): State<Arc<AppState<D>>>,
    Path((store, oid)): Path<(String, String)>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    // Rejected before any connection is leased
    let oid: Oid = oid.parse()?;
    let source = state.stores.resolve(&store)?;

    let download = start_download(&source, oid, state.transfer).await?;
    info!(%store, %oid, size = download.size, "download started");

    let headers = DownloadHeaders::for_object(
        oid,
        download.size,
        params.filename.as_deref(),
        params.content_type.as_deref(),
        params.disposition.as_deref(),
    );
    stream_response(headers, download)
}

/// POST /pg-upload/{store}
async fn upload_object<D: StoreDirectory>(
    State(state): State<Arc<AppState<D>>>,
    Path(store): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<UploadReceipt>), ApiError> {
    let source = state.stores.resolve(&store)?;
    let mimetype = params
        .mimetype
        .or_else(|| request_content_type(&headers))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let filename = params.filename.unwrap_or_else(|| "upload.bin".to_string());

    let receipt = upload(&source, body_stream(body), filename, mimetype, state.transfer).await?;
    info!(%store, oid = %receipt.oid, bytes = receipt.bytes, "upload committed");

    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Large-object routes
pub fn router<D: StoreDirectory>() -> Router<Arc<AppState<D>>> {
    Router::new()
        .route("/pg-download/{store}/{oid}", get(download_object::<D>))
        .route("/pg-upload/{store}", post(upload_object::<D>))
}
