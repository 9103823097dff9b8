//! Chunked byte copy between a stream source and a sink, under flow control.
//!
//! # Flow control
//!
//! The pump is strictly sequential: it pulls one chunk from the source,
//! awaits [`ChunkSink::write_chunk`], and only then pulls the next one. A
//! saturated sink simply does not complete its write until it has capacity
//! again, so the source is never read more than one chunk ahead of the sink.
//!
//! ```text
//!   source ──next()──▶ chunk ──write_chunk().await──▶ sink
//!      ▲                                  │
//!      └──────── resumes when drained ◀───┘
//! ```
//!
//! # Termination
//!
//! - source EOF: [`ChunkSink::finish`] is awaited, the byte count returned
//! - source or sink error: the pump returns at once. Neither side is
//!   finished or closed by the pump; the caller owns both.

use std::io;
use std::pin::pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Owned stream of byte chunks: response bodies, registered streams.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Bounded channel of byte chunks.
///
/// The sender is a [`ChunkSink`] whose writes wait while `depth` chunks are
/// queued; the receiving half is a [`ByteStream`]. Used to feed HTTP
/// response bodies and to tee inbound streams into the registry, so that
/// at most `depth` chunks are ever buffered between producer and consumer.
pub fn byte_channel(depth: usize) -> (mpsc::Sender<io::Result<Bytes>>, ByteStream) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (tx, ReceiverStream::new(rx).boxed())
}

/// Destination of a pump.
#[async_trait]
pub trait ChunkSink: Send {
    /// Accept one chunk. Completes only once the sink can take more data.
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;

    /// Flush and close after the source reached EOF.
    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Which side of the pump failed.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("source failed: {0}")]
    Source(#[source] io::Error),

    #[error("sink failed: {0}")]
    Sink(#[source] io::Error),
}

impl PumpError {
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Source(e) | Self::Sink(e) => e,
        }
    }
}

/// Copy `source` into `sink` in chunks of at most `chunk_size` bytes.
///
/// Returns the number of bytes written to the sink.
pub async fn pump<S, K>(source: S, sink: &mut K, chunk_size: usize) -> Result<u64, PumpError>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
    K: ChunkSink + ?Sized,
{
    let chunk_size = chunk_size.max(1);
    let mut source = pin!(source);
    let mut copied: u64 = 0;

    while let Some(item) = source.next().await {
        let mut chunk = item.map_err(PumpError::Source)?;

        while !chunk.is_empty() {
            let piece = if chunk.len() > chunk_size {
                chunk.split_to(chunk_size)
            } else {
                std::mem::take(&mut chunk)
            };
            let len = piece.len() as u64;
            sink.write_chunk(piece).await.map_err(PumpError::Sink)?;
            copied += len;
        }
    }

    sink.finish().await.map_err(PumpError::Sink)?;
    Ok(copied)
}

/// Turn an [`AsyncRead`] into a stream of chunks of at most `chunk_size`.
pub fn reader_stream<R>(reader: R, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send,
{
    let chunk_size = chunk_size.max(1);
    futures::stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = BytesMut::with_capacity(chunk_size);
        while buf.len() < chunk_size {
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Some((Err(e), None)),
            }
        }
        if buf.is_empty() {
            None
        } else {
            Some((Ok(buf.freeze()), Some(reader)))
        }
    })
}

/// Bounded channel feeding an HTTP response body or a registered stream.
///
/// `send` waits for a free slot, which is the drain signal. A dropped
/// receiver means the consumer went away and surfaces as `BrokenPipe`.
#[async_trait]
impl ChunkSink for mpsc::Sender<io::Result<Bytes>> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
    }
}

/// Sink over any async writer (files, pipes).
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.writer.write_all(&chunk).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Sink that sleeps on every write and records the chunks it got.
    struct SlowSink {
        delay: Duration,
        chunks: Vec<Bytes>,
        in_flight: usize,
        max_in_flight: usize,
        finished: bool,
    }

    impl SlowSink {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                chunks: Vec::new(),
                in_flight: 0,
                max_in_flight: 0,
                finished: false,
            }
        }
    }

    #[async_trait]
    impl ChunkSink for SlowSink {
        async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
            self.in_flight += 1;
            self.max_in_flight = self.max_in_flight.max(self.in_flight);
            tokio::time::sleep(self.delay).await;
            self.chunks.push(chunk);
            self.in_flight -= 1;
            Ok(())
        }

        async fn finish(&mut self) -> io::Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl ChunkSink for FailingSink {
        async fn write_chunk(&mut self, _chunk: Bytes) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        async fn finish(&mut self) -> io::Result<()> {
            panic!("finish must not run after a failed write");
        }
    }

    fn chunks_of(total: usize, size: usize) -> Vec<io::Result<Bytes>> {
        (0..total)
            .step_by(size)
            .map(|start| {
                let end = (start + size).min(total);
                Ok(Bytes::from(
                    (start..end).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
                ))
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_gated_by_sink_drains() {
        let source = futures::stream::iter(chunks_of(10 * DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE));
        let mut sink = SlowSink::new(Duration::from_millis(50));

        let started = Instant::now();
        let copied = pump(source, &mut sink, DEFAULT_CHUNK_SIZE).await.unwrap();

        assert_eq!(copied, 10 * DEFAULT_CHUNK_SIZE as u64);
        assert_eq!(sink.chunks.len(), 10);
        assert_eq!(sink.max_in_flight, 1);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn oversized_chunks_are_split() {
        let source = futures::stream::iter(vec![Ok(Bytes::from(vec![7u8; 2500]))]);
        let mut sink = SlowSink::new(Duration::ZERO);

        let copied = pump(source, &mut sink, 1000).await.unwrap();

        assert_eq!(copied, 2500);
        let sizes: Vec<usize> = sink.chunks.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[tokio::test]
    async fn source_error_stops_without_finishing() {
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
            Ok(Bytes::from_static(b"never")),
        ]);
        let mut sink = SlowSink::new(Duration::ZERO);

        let err = pump(source, &mut sink, 16).await.unwrap_err();

        assert!(matches!(err, PumpError::Source(_)));
        assert_eq!(sink.chunks.len(), 1);
        assert!(!sink.finished);
    }

    #[tokio::test]
    async fn sink_error_is_reported_as_sink() {
        let source = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]);
        let err = pump(source, &mut FailingSink, 16).await.unwrap_err();
        assert!(matches!(err, PumpError::Sink(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn empty_source_still_finishes() {
        let source = futures::stream::empty::<io::Result<Bytes>>();
        let mut sink = SlowSink::new(Duration::ZERO);

        assert_eq!(pump(source, &mut sink, 16).await.unwrap(), 0);
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
        drop(rx);

        let source = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]);
        let err = pump(source, &mut tx, 16).await.unwrap_err();

        assert_eq!(err.into_io().kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn reader_stream_copies_into_writer() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let mut sink = WriterSink::new(Vec::new());

        let copied = pump(reader_stream(&data[..], 4096), &mut sink, 4096)
            .await
            .unwrap();

        assert_eq!(copied, data.len() as u64);
        assert_eq!(sink.into_inner(), data);
    }
}
