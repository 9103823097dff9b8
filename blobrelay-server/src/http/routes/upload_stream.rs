//! Two-phase multipart upload
//!
//! `POST /upload-stream?target=file|pg:<store>`
//!
//! Phase 1 (this handler) registers every file field in the stream registry
//! and queues its id for the handoff worker. Phase 2 (the worker) claims the
//! stream and uploads it. The field is relayed through a bounded channel, so
//! it is read from the client only as fast as phase 2 writes it out.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Query, State},
    routing::post,
    Json, Router,
};
use blobrelay_core::{byte_channel, pump, PumpError, StreamId, StreamMetadata, TransferError};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::body_error;
use crate::directory::StoreDirectory;
use crate::handoff::{HandoffReceipt, HandoffTarget};
use crate::http::error::ApiError;
use crate::http::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct UploadStreamParams {
    pub target: Option<String>,
}

/// One handed-off field
#[derive(Debug, Serialize)]
pub struct HandoffResult {
    pub field: Option<String>,
    pub stream_id: StreamId,
    pub receipt: HandoffReceipt,
}

#[derive(Debug, Serialize)]
pub struct UploadStreamResponse {
    pub uploads: Vec<HandoffResult>,
}

/// POST /upload-stream
async fn upload_stream<D: StoreDirectory>(
    State(state): State<Arc<AppState<D>>>,
    Query(params): Query<UploadStreamParams>,
    mut multipart: Multipart,
) -> Result<Json<UploadStreamResponse>, ApiError> {
    let target: HandoffTarget = params.target.as_deref().unwrap_or("file").parse()?;
    if let HandoffTarget::Pg(store) = &target {
        // fail before reading the body
        state.stores.resolve(store)?;
    }

    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            debug!(field = ?field.name(), "skipping non-file field");
            continue;
        };
        let metadata = StreamMetadata {
            field_name: field.name().map(str::to_string),
            filename,
            mimetype: field
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
        };
        let field_name = metadata.field_name.clone();

        let (mut relay, relayed) = byte_channel(state.transfer.channel_depth);
        let id = state.registry.register(relayed, metadata)?;
        let reply = state.handoff.submit(id, target.clone()).await?;

        let source = field.map_err(body_error);
        match pump(source, &mut relay, state.transfer.chunk_size).await {
            Ok(bytes) => debug!(stream_id = %id, bytes, "field relayed"),
            Err(PumpError::Source(e)) => {
                // surface the broken body to phase 2 so it rolls back
                let _ = relay.send(Err(e)).await;
            }
            // phase 2 stopped reading; its reply carries the reason
            Err(PumpError::Sink(_)) => {}
        }
        drop(relay);

        let receipt = reply
            .await
            .map_err(|_| TransferError::store("handoff worker dropped the job"))??;
        info!(stream_id = %id, target = %target, "handoff complete");
        uploads.push(HandoffResult {
            field: field_name,
            stream_id: id,
            receipt,
        });
    }

    Ok(Json(UploadStreamResponse { uploads }))
}

/// Multipart handoff routes
pub fn router<D: StoreDirectory>() -> Router<Arc<AppState<D>>> {
    Router::new().route("/upload-stream", post(upload_stream::<D>))
}
