//! Filesystem endpoints
//!
//! - `GET /file-download/{filename}` streams a file from the download dir
//! - `POST /file-upload?filename=` streams the body into the upload dir

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use blobrelay_core::{start_file_download, upload_file, DownloadHeaders, StoredFile};
use serde::Deserialize;
use tracing::info;

use super::{body_stream, stream_response};
use crate::directory::StoreDirectory;
use crate::http::error::ApiError;
use crate::http::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct FileDownloadParams {
    pub content_type: Option<String>,
    pub disposition: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileUploadParams {
    pub filename: Option<String>,
}

/// GET /file-download/{filename}
async fn download_file<D: StoreDirectory>(
    State(state): State<Arc<AppState<D>>>,
    Path(filename): Path<String>,
    Query(params): Query<FileDownloadParams>,
) -> Result<Response, ApiError> {
    let download = start_file_download(&state.files.download_dir, &filename, state.transfer).await?;
    info!(file = %filename, size = download.size, "file download started");

    let headers = DownloadHeaders::for_file(
        &filename,
        download.size,
        params.content_type.as_deref(),
        params.disposition.as_deref(),
    );
    stream_response(headers, download)
}

/// POST /file-upload
async fn upload_to_file<D: StoreDirectory>(
    State(state): State<Arc<AppState<D>>>,
    Query(params): Query<FileUploadParams>,
    body: Body,
) -> Result<(StatusCode, Json<StoredFile>), ApiError> {
    let filename = params.filename.ok_or_else(|| ApiError::BadRequest {
        message: "missing query parameter 'filename'".to_string(),
    })?;

    let stored = upload_file(&state.files.upload_dir, body_stream(body), &filename, state.transfer).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

/// File routes
pub fn router<D: StoreDirectory>() -> Router<Arc<AppState<D>>> {
    Router::new()
        .route("/file-download/{filename}", get(download_file::<D>))
        .route("/file-upload", post(upload_to_file::<D>))
}
