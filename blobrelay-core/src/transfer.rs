//! Large-object download and upload over a [`TransactionSource`].
//!
//! Both directions lease one connection, open one transaction, and end it
//! exactly once through a [`TransactionGuard`]:
//!
//! | direction | success | failure / disconnect |
//! |-----------|---------|----------------------|
//! | download  | commit (read-only) after EOF | rollback |
//! | upload    | commit, then report the OID  | rollback, no OID is reported |

use std::io;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Outcome, Result, TransferError};
use crate::guard::{Decision, Resolution, TransactionGuard};
use crate::handle::from_io;
use crate::pump::{byte_channel, pump, ByteStream, PumpError, DEFAULT_CHUNK_SIZE};
use crate::store::{LargeObjectTransaction, Oid, TransactionSource};

/// Chunking and buffering knobs shared by every transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum bytes per read/write
    pub chunk_size: usize,
    /// Chunks buffered between a producer task and a response body
    pub channel_depth: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            channel_depth: 1,
        }
    }
}

/// A download whose source is open and whose size is known.
///
/// `body` yields the content; dropping it is how a consumer disconnects.
/// `task` resolves to the transfer's terminal outcome once the transaction
/// (if any) has been resolved and the connection released.
pub struct Download {
    pub size: u64,
    pub body: ByteStream,
    pub task: JoinHandle<Outcome>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").field("size", &self.size).finish_non_exhaustive()
    }
}

/// Headers announced before the first body byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadHeaders {
    pub content_length: u64,
    pub content_type: String,
    pub content_disposition: String,
}

impl DownloadHeaders {
    /// Build headers for a large object, filling in the defaults
    /// `oid-<oid>.bin`, `application/octet-stream` and `attachment`.
    pub fn for_object(
        oid: Oid,
        size: u64,
        filename: Option<&str>,
        content_type: Option<&str>,
        disposition: Option<&str>,
    ) -> Self {
        let default_name = format!("oid-{oid}.bin");
        Self::for_file(
            filename.unwrap_or(&default_name),
            size,
            content_type,
            disposition,
        )
    }

    pub fn for_file(
        filename: &str,
        size: u64,
        content_type: Option<&str>,
        disposition: Option<&str>,
    ) -> Self {
        Self {
            content_length: size,
            content_type: content_type
                .filter(|s| !s.is_empty())
                .unwrap_or("application/octet-stream")
                .to_string(),
            content_disposition: content_disposition(
                disposition.filter(|s| !s.is_empty()).unwrap_or("attachment"),
                filename,
            ),
        }
    }
}

/// `<disposition>; filename="<name>"`, with quotes and control characters
/// removed from the name.
pub fn content_disposition(disposition: &str, filename: &str) -> String {
    let name: String = filename
        .chars()
        .filter(|c| *c != '"' && *c != '\\' && !c.is_control())
        .collect();
    format!("{disposition}; filename=\"{name}\"")
}

/// What a committed upload produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub oid: Oid,
    pub filename: String,
    pub mimetype: String,
    /// Bytes written into the object
    pub bytes: u64,
}

/// Open large object `oid` and start streaming it.
///
/// Returns once the object is open and its size known, so the caller can
/// send headers; the bytes then flow through [`Download::body`] from a
/// spawned task. Errors before that point (pool, missing object, denied)
/// are returned here after the transaction has been rolled back.
pub async fn start_download<S>(store: &S, oid: Oid, config: TransferConfig) -> Result<Download>
where
    S: TransactionSource + ?Sized,
{
    let guard = TransactionGuard::begin(store, format!("download oid={oid}")).await?;
    let (ready_tx, ready_rx) = oneshot::channel();
    let (body_tx, body) = byte_channel(config.channel_depth);

    let task = tokio::spawn(run_download(guard, oid, config.chunk_size, ready_tx, body_tx));

    match ready_rx.await {
        Ok(Ok(size)) => Ok(Download { size, body, task }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransferError::store("download task ended before the object was opened")),
    }
}

async fn run_download<T>(
    mut guard: TransactionGuard<T>,
    oid: Oid,
    chunk_size: usize,
    ready: oneshot::Sender<Result<u64>>,
    mut body: mpsc::Sender<io::Result<Bytes>>,
) -> Outcome
where
    T: LargeObjectTransaction,
{
    let opened = match guard.open_for_read(oid).await {
        Ok(mut handle) => match handle.size().await {
            Ok(size) => Ok((handle, size)),
            Err(e) => {
                close_quietly(handle).await;
                Err(e)
            }
        },
        Err(e) => Err(e),
    };
    let (mut handle, size) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let outcome = e.outcome();
            let _ = ready.send(Err(e));
            guard.resolve(Decision::Rollback { cause: outcome }).await;
            return outcome;
        }
    };

    if ready.send(Ok(size)).is_err() {
        close_quietly(handle).await;
        guard
            .resolve(Decision::Rollback {
                cause: Outcome::Cancelled,
            })
            .await;
        return Outcome::Cancelled;
    }

    debug!(%oid, size, "download streaming");
    let copied = pump_to_body(handle.chunks(chunk_size), &mut body, chunk_size).await;
    let result = match copied {
        Ok(bytes) => handle.close().await.map(|()| bytes),
        Err(e) => {
            close_quietly(handle).await;
            Err(e)
        }
    };

    match result {
        Ok(bytes) => match guard.resolve(Decision::Commit).await {
            Resolution::Failed { .. } => Outcome::StreamError,
            _ => {
                info!(%oid, bytes, "download complete");
                Outcome::Success
            }
        },
        Err(e) => {
            let outcome = e.outcome();
            if outcome != Outcome::Cancelled {
                warn!(%oid, error = %e, "download aborted");
                abort_body(&body, &e).await;
            } else {
                info!(%oid, "client disconnected during download");
            }
            guard.resolve(Decision::Rollback { cause: outcome }).await;
            outcome
        }
    }
}

/// Pump `source` into a response body channel until EOF, an error, or the
/// receiving side is dropped.
///
/// Disconnect is noticed even while the pump is parked waiting for the next
/// source chunk, and the pending read is abandoned.
pub(crate) async fn pump_to_body<S>(
    source: S,
    body: &mut mpsc::Sender<io::Result<Bytes>>,
    chunk_size: usize,
) -> Result<u64>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let watcher = body.clone();
    tokio::select! {
        copied = pump(source, body, chunk_size) => copied.map_err(|e| match e {
            PumpError::Sink(_) => TransferError::Cancelled,
            PumpError::Source(e) => from_io(e),
        }),
        () = watcher.closed() => Err(TransferError::Cancelled),
    }
}

/// Push an error item so the server aborts a response whose headers are
/// already out, instead of ending it as if it were complete.
pub(crate) async fn abort_body(body: &mpsc::Sender<io::Result<Bytes>>, error: &TransferError) {
    let item = Err(io::Error::other(error.to_string()));
    tokio::select! {
        _ = body.send(item) => {}
        () = body.closed() => {}
    }
}

/// Stream `source` into a new large object and commit.
///
/// The returned receipt is only produced after COMMIT succeeded; any error,
/// including a failed COMMIT, rolls back and leaves no object behind.
pub async fn upload<S, St>(
    store: &S,
    source: St,
    filename: impl Into<String>,
    mimetype: impl Into<String>,
    config: TransferConfig,
) -> Result<UploadReceipt>
where
    S: TransactionSource + ?Sized,
    St: Stream<Item = io::Result<Bytes>> + Send,
{
    let filename = filename.into();
    let mimetype = mimetype.into();
    let mut guard = TransactionGuard::begin(store, format!("upload {filename}")).await?;

    let written = write_object(&mut guard, source, config.chunk_size).await;
    match written {
        Ok((oid, size)) => match guard.resolve(Decision::Commit).await {
            Resolution::Committed => {
                info!(%oid, %filename, size, "upload committed");
                Ok(UploadReceipt {
                    oid,
                    filename,
                    mimetype,
                    bytes: size,
                })
            }
            Resolution::Failed { error, .. } => Err(error),
            other => Err(TransferError::store(format!(
                "upload transaction resolved unexpectedly: {other:?}"
            ))),
        },
        Err(e) => {
            warn!(%filename, error = %e, "upload failed, rolling back");
            guard.resolve(Decision::Rollback { cause: e.outcome() }).await;
            Err(e)
        }
    }
}

async fn write_object<T, St>(
    guard: &mut TransactionGuard<T>,
    source: St,
    chunk_size: usize,
) -> Result<(Oid, u64)>
where
    T: LargeObjectTransaction,
    St: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut sink = guard.create_for_write().await?;
    let oid = sink.oid();
    debug!(%oid, "upload streaming");

    match pump(source, &mut sink, chunk_size).await {
        Ok(size) => Ok((oid, size)),
        Err(e) => {
            sink.abandon().await;
            Err(match e {
                PumpError::Source(e) if is_disconnect(&e) => TransferError::Cancelled,
                PumpError::Source(e) | PumpError::Sink(e) => from_io(e),
            })
        }
    }
}

/// The peer went away mid-transfer.
pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

async fn close_quietly<T: LargeObjectTransaction>(handle: crate::handle::LargeObjectHandle<'_, T>) {
    let oid = handle.oid();
    if let Err(e) = handle.close().await {
        debug!(%oid, error = %e, "close before rollback ignored");
    }
}
