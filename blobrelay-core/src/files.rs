//! Filesystem variant of the transfer engine.
//!
//! Same pump and disconnect handling as the large-object paths, with files
//! in place of objects and no transaction: a failed upload deletes its
//! partial file instead of rolling back.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Outcome, Result, TransferError};
use crate::handle::from_io;
use crate::pump::{byte_channel, pump, reader_stream, PumpError, WriterSink};
use crate::transfer::{abort_body, is_disconnect, pump_to_body, Download, TransferConfig};

/// Where an uploaded file ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    /// Name on disk: `<uuid>-<original>`
    pub filename: String,
    pub original_filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Open `dir/name` and start streaming it.
///
/// Missing files are `NotFound`, unreadable ones `Denied`. Names that would
/// escape `dir` are rejected as `InvalidInput`.
pub async fn start_file_download(dir: &Path, name: &str, config: TransferConfig) -> Result<Download> {
    let relative = checked_name(name)?;
    let path = dir.join(relative);

    let metadata = fs::metadata(&path)
        .await
        .map_err(|e| TransferError::from_fs(e, name))?;
    if !metadata.is_file() {
        return Err(TransferError::not_found("file", name));
    }
    let file = File::open(&path)
        .await
        .map_err(|e| TransferError::from_fs(e, name))?;

    let size = metadata.len();
    let (mut body_tx, body) = byte_channel(config.channel_depth);
    let chunk_size = config.chunk_size;
    let name = name.to_string();

    let task = tokio::spawn(async move {
        let result = pump_to_body(reader_stream(file, chunk_size), &mut body_tx, chunk_size).await;
        match result {
            Ok(bytes) => {
                info!(file = %name, bytes, "file download complete");
                Outcome::Success
            }
            Err(TransferError::Cancelled) => {
                info!(file = %name, "client disconnected during file download");
                Outcome::Cancelled
            }
            Err(e) => {
                warn!(file = %name, error = %e, "file download aborted");
                abort_body(&body_tx, &e).await;
                e.outcome()
            }
        }
    });

    Ok(Download { size, body, task })
}

/// Stream `source` into a new file under `dir`.
///
/// The file is named `<uuid>-<original>` so concurrent uploads of the same
/// name never collide. On failure the partial file is removed.
pub async fn upload_file<St>(
    dir: &Path,
    source: St,
    original_filename: &str,
    config: TransferConfig,
) -> Result<StoredFile>
where
    St: Stream<Item = io::Result<Bytes>> + Send,
{
    let original = checked_name(original_filename)?;
    fs::create_dir_all(dir)
        .await
        .map_err(|e| TransferError::from_fs(e, dir.display()))?;

    let filename = format!("{}-{}", Uuid::new_v4(), original);
    let path = dir.join(&filename);
    let file = File::create(&path)
        .await
        .map_err(|e| TransferError::from_fs(e, &filename))?;
    debug!(path = %path.display(), "file upload started");

    let mut sink = WriterSink::new(file);
    match pump(source, &mut sink, config.chunk_size).await {
        Ok(size) => {
            info!(path = %path.display(), size, "file upload complete");
            Ok(StoredFile {
                filename,
                original_filename: original.to_string(),
                path,
                bytes: size,
            })
        }
        Err(e) => {
            drop(sink);
            if let Err(rm) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %rm, "could not remove partial upload");
            }
            warn!(path = %path.display(), error = %e, "file upload failed");
            Err(match e {
                PumpError::Source(e) if is_disconnect(&e) => TransferError::Cancelled,
                PumpError::Source(e) | PumpError::Sink(e) => from_io(e),
            })
        }
    }
}

/// Bare file names only; anything with a directory component is rejected.
fn checked_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    let base = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n == trimmed);
    base.ok_or_else(|| TransferError::invalid_input(format!("invalid file name: '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn source(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        futures::stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let stored = upload_file(dir.path(), source(&[b"hello ", b"files"]), "greeting.txt", TransferConfig::default())
            .await
            .unwrap();

        assert!(stored.filename.ends_with("-greeting.txt"));
        assert_eq!(stored.bytes, 11);

        let download = start_file_download(dir.path(), &stored.filename, TransferConfig::default())
            .await
            .unwrap();
        assert_eq!(download.size, 11);
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello files");
        assert_eq!(download.task.await.unwrap(), Outcome::Success);
    }

    #[tokio::test]
    async fn failed_upload_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let failing = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("bad chunk")),
        ]);

        let err = upload_file(dir.path(), failing, "x.bin", TransferConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Io { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn client_reset_cancels_file_upload() {
        let dir = tempfile::tempdir().unwrap();
        let reset = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);

        let err = upload_file(dir.path(), reset, "x.bin", TransferConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(err.outcome(), Outcome::Cancelled);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = start_file_download(dir.path(), "nope.bin", TransferConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.outcome(), Outcome::NotFound);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["../etc/passwd", "a/b.txt", "", ".."] {
            let err = start_file_download(dir.path(), name, TransferConfig::default())
                .await
                .unwrap_err();
            assert!(matches!(err, TransferError::InvalidInput { .. }), "{name}");
        }
    }

    #[tokio::test]
    async fn dropped_body_cancels_file_download() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.bin"), vec![1u8; 64 * 1024]).unwrap();
        let config = TransferConfig {
            chunk_size: 1024,
            channel_depth: 1,
        };

        let download = start_file_download(dir.path(), "big.bin", config).await.unwrap();
        drop(download.body);

        assert_eq!(download.task.await.unwrap(), Outcome::Cancelled);
    }
}
