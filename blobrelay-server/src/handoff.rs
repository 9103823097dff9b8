//! Phase 2 of the stream handoff.
//!
//! The multipart route registers each inbound file stream and queues a
//! [`HandoffJob`] naming it. The worker claims the stream from the registry
//! in a task of its own and uploads it to the requested target, replying
//! with a receipt.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use blobrelay_core::{upload, upload_file, StoredFile, StreamId, TransferError, UploadReceipt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::directory::StoreDirectory;
use crate::http::server::AppState;

/// Where a handed-off stream ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffTarget {
    /// New large object in the named store
    Pg(String),
    /// New file in the upload directory
    File,
}

impl FromStr for HandoffTarget {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("pg", store)) if !store.is_empty() => Ok(Self::Pg(store.to_string())),
            None if s == "file" => Ok(Self::File),
            _ => Err(TransferError::invalid_input(format!(
                "invalid target '{s}', expected 'file' or 'pg:<store>'"
            ))),
        }
    }
}

impl fmt::Display for HandoffTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pg(store) => write!(f, "pg:{store}"),
            Self::File => f.write_str("file"),
        }
    }
}

/// Result of a completed handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandoffReceipt {
    LargeObject(UploadReceipt),
    File(StoredFile),
}

pub type HandoffReply = oneshot::Receiver<Result<HandoffReceipt, TransferError>>;

/// One claimed-later stream.
pub struct HandoffJob {
    pub id: StreamId,
    pub target: HandoffTarget,
    reply: oneshot::Sender<Result<HandoffReceipt, TransferError>>,
}

/// Sending half of the handoff queue.
#[derive(Clone)]
pub struct HandoffQueue {
    tx: mpsc::Sender<HandoffJob>,
}

impl HandoffQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<HandoffJob>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Queue `id` for upload to `target`; the reply arrives once it is done.
    pub async fn submit(&self, id: StreamId, target: HandoffTarget) -> Result<HandoffReply, TransferError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HandoffJob { id, target, reply })
            .await
            .map_err(|_| TransferError::store("handoff worker is not running"))?;
        Ok(rx)
    }
}

/// Run jobs from `jobs` until every queue handle is dropped. Each job gets
/// its own task, so a slow upload never holds up the next one.
pub fn spawn_worker<D: StoreDirectory>(
    state: Arc<AppState<D>>,
    mut jobs: mpsc::Receiver<HandoffJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let state = Arc::clone(&state);
            let span = tracing::info_span!("handoff", stream_id = %job.id, target = %job.target);
            tokio::spawn(
                async move {
                    let result = run_job(&state, job.id, &job.target).await;
                    if let Err(e) = &result {
                        warn!(error = %e, "handoff failed");
                    }
                    if job.reply.send(result).is_err() {
                        debug!("handoff requester went away before the reply");
                    }
                }
                .instrument(span),
            );
        }
        debug!("handoff queue closed");
    })
}

async fn run_job<D: StoreDirectory>(
    state: &AppState<D>,
    id: StreamId,
    target: &HandoffTarget,
) -> Result<HandoffReceipt, TransferError> {
    let (stream, metadata) = state.registry.take(id)?;

    match target {
        HandoffTarget::Pg(name) => {
            let store = state.stores.resolve(name)?;
            let receipt = upload(&store, stream, metadata.filename, metadata.mimetype, state.transfer).await?;
            info!(oid = %receipt.oid, bytes = receipt.bytes, "handoff stored large object");
            Ok(HandoffReceipt::LargeObject(receipt))
        }
        HandoffTarget::File => {
            let stored = upload_file(&state.files.upload_dir, stream, &metadata.filename, state.transfer).await?;
            info!(path = %stored.path.display(), bytes = stored.bytes, "handoff stored file");
            Ok(HandoffReceipt::File(stored))
        }
    }
}
