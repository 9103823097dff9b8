//! One open large object inside one transaction.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tracing::debug;

use crate::error::{Result, TransferError};
use crate::pump::ChunkSink;
use crate::store::{AccessMode, LargeObjectTransaction, LoFd, Oid};

/// An open large object, borrowing the transaction it lives in.
///
/// The borrow ties the handle to its transaction: it cannot outlive it, and
/// the transaction cannot be resolved while the handle is still open.
/// [`close`](Self::close) consumes the handle, so closing twice does not
/// compile.
pub struct LargeObjectHandle<'t, T: LargeObjectTransaction> {
    tx: &'t mut T,
    oid: Oid,
    fd: LoFd,
    mode: AccessMode,
}

impl<'t, T: LargeObjectTransaction> LargeObjectHandle<'t, T> {
    /// Open an existing object for reading.
    pub async fn open_for_read(tx: &'t mut T, oid: Oid) -> Result<Self> {
        let fd = tx.lo_open(oid, AccessMode::Read).await?;
        debug!(%oid, fd = fd.0, "opened large object for read");
        Ok(Self {
            tx,
            oid,
            fd,
            mode: AccessMode::Read,
        })
    }

    /// Create a new object and open it for writing.
    ///
    /// The OID is usable immediately; the content is durable only once the
    /// owning transaction commits.
    pub async fn create_for_write(tx: &'t mut T) -> Result<Self> {
        let oid = tx.lo_create().await?;
        let fd = tx.lo_open(oid, AccessMode::Write).await?;
        debug!(%oid, fd = fd.0, "created large object for write");
        Ok(Self {
            tx,
            oid,
            fd,
            mode: AccessMode::Write,
        })
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Length of the object in bytes. Read handles only.
    pub async fn size(&mut self) -> Result<u64> {
        self.expect_mode(AccessMode::Read)?;
        self.tx.lo_size(self.fd).await
    }

    /// Next chunk of at most `max` bytes, `None` at EOF.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        self.expect_mode(AccessMode::Read)?;
        let chunk = self.tx.lo_read(self.fd, max).await?;
        Ok(if chunk.is_empty() { None } else { Some(chunk) })
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.expect_mode(AccessMode::Write)?;
        self.tx.lo_write(self.fd, data).await
    }

    pub async fn close(self) -> Result<()> {
        self.tx.lo_close(self.fd).await?;
        debug!(oid = %self.oid, "closed large object");
        Ok(())
    }

    /// Stream the remaining content in chunks of at most `chunk_size`.
    ///
    /// The stream only borrows the handle, which stays open afterwards.
    pub fn chunks(&mut self, chunk_size: usize) -> BoxStream<'_, io::Result<Bytes>> {
        futures::stream::unfold(Some(self), move |state| async move {
            let handle = state?;
            match handle.read_chunk(chunk_size).await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(handle))),
                Ok(None) => None,
                Err(e) => Some((Err(into_io(e)), None)),
            }
        })
        .boxed()
    }

    fn expect_mode(&self, mode: AccessMode) -> Result<()> {
        if self.mode != mode {
            return Err(TransferError::invalid_input(format!(
                "large object {} is open for {:?}, not {:?}",
                self.oid, self.mode, mode
            )));
        }
        Ok(())
    }
}

/// Pump sink writing into a large object opened for write.
///
/// `finish` closes the object; on a failed pump the caller closes it with
/// [`LargeObjectSink::abandon`] or leaves it to the rollback.
pub struct LargeObjectSink<'t, T: LargeObjectTransaction> {
    oid: Oid,
    handle: Option<LargeObjectHandle<'t, T>>,
}

impl<'t, T: LargeObjectTransaction> LargeObjectSink<'t, T> {
    pub async fn create(tx: &'t mut T) -> Result<Self> {
        let handle = LargeObjectHandle::create_for_write(tx).await?;
        Ok(Self {
            oid: handle.oid(),
            handle: Some(handle),
        })
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Best-effort close after a failed transfer. The transaction is about
    /// to roll back, so errors here are only logged.
    pub async fn abandon(mut self) {
        if let Some(handle) = self.handle.take() {
            let oid = handle.oid();
            if let Err(e) = handle.close().await {
                debug!(%oid, error = %e, "close after failed write ignored");
            }
        }
    }
}

#[async_trait]
impl<'t, T: LargeObjectTransaction> ChunkSink for LargeObjectSink<'t, T> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "large object already closed"))?;
        handle.write_chunk(&chunk).await.map_err(into_io)
    }

    async fn finish(&mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.close().await.map_err(into_io),
            None => Ok(()),
        }
    }
}

/// Carry a [`TransferError`] through an `io::Error` across the pump.
pub(crate) fn into_io(err: TransferError) -> io::Error {
    match err {
        TransferError::Io { source } => source,
        other => io::Error::other(other),
    }
}

/// Recover the [`TransferError`] wrapped by [`into_io`], if any.
pub(crate) fn from_io(err: io::Error) -> TransferError {
    if err.get_ref().is_some_and(|inner| inner.is::<TransferError>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(original) = inner.downcast::<TransferError>() {
                return *original;
            }
        }
        return TransferError::store("unrecoverable store error");
    }
    TransferError::Io { source: err }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::TransactionSource;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn read_handle_reports_size_and_eof() {
        let store = MemoryStore::new();
        let oid = store.insert_committed(b"hello large object".to_vec());

        let mut tx = store.begin().await.unwrap();
        let mut handle = LargeObjectHandle::open_for_read(&mut tx, oid).await.unwrap();

        assert_eq!(handle.size().await.unwrap(), 18);
        assert_eq!(handle.read_chunk(5).await.unwrap().unwrap(), "hello");
        assert_eq!(handle.read_chunk(100).await.unwrap().unwrap(), " large object");
        assert!(handle.read_chunk(100).await.unwrap().is_none());

        handle.close().await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn open_missing_object_is_not_found() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let err = LargeObjectHandle::open_for_read(&mut tx, Oid::new(999999).unwrap())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, TransferError::NotFound { .. }));
    }

    #[tokio::test]
    async fn write_handle_refuses_reads() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut handle = LargeObjectHandle::create_for_write(&mut tx).await.unwrap();

        assert_eq!(handle.mode(), AccessMode::Write);
        assert!(matches!(
            handle.size().await,
            Err(TransferError::InvalidInput { .. })
        ));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn chunks_stream_yields_whole_object() {
        let store = MemoryStore::new();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
        let oid = store.insert_committed(data.clone());

        let mut tx = store.begin().await.unwrap();
        let mut handle = LargeObjectHandle::open_for_read(&mut tx, oid).await.unwrap();
        let chunks: Vec<Bytes> = handle.chunks(1024).try_collect().await.unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);
        handle.close().await.unwrap();
    }

    #[test]
    fn io_round_trip_keeps_transfer_error() {
        let io = into_io(TransferError::not_found("large object", 7));
        assert!(matches!(from_io(io), TransferError::NotFound { .. }));

        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(from_io(io), TransferError::Io { .. }));
    }
}
