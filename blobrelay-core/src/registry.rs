//! Two-phase handoff of inbound byte streams.
//!
//! Step 1 receives a stream it does not consume itself and registers it
//! under a fresh random id. Step 2, an independent unit of work in the same
//! process, claims it with [`StreamRegistry::take`]. Claiming removes the
//! entry atomically, so a stream is consumed at most once.
//!
//! The registry is an explicit service object shared through an `Arc`, not
//! ambient global state. Unclaimed entries would otherwise live for the
//! whole process, so the registry bounds its size and expires entries
//! older than the configured TTL.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, TransferError};
use crate::pump::ByteStream;

/// A registered inbound byte stream.
pub type InboundStream = ByteStream;

/// Opaque 128-bit identifier of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for StreamId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| TransferError::invalid_input(format!("invalid stream id: '{s}'")))
    }
}

/// What step 1 knew about the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Multipart field the stream came from
    pub field_name: Option<String>,
    pub filename: String,
    pub mimetype: String,
}

/// Size and expiry policy.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Entries older than this are dropped by [`StreamRegistry::sweep_expired`]
    pub ttl: Option<Duration>,
    /// Maximum number of unclaimed entries
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(300)),
            capacity: 64,
        }
    }
}

struct Entry {
    // Mutex only to make the entry Sync; it is never contended
    stream: Mutex<InboundStream>,
    metadata: StreamMetadata,
    registered_at: Instant,
}

/// Concurrent map from [`StreamId`] to a not-yet-consumed stream.
pub struct StreamRegistry {
    entries: DashMap<StreamId, Entry>,
    count: AtomicUsize,
    config: RegistryConfig,
}

impl StreamRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            config,
        }
    }

    /// Register `stream` and return the id to claim it with.
    ///
    /// Fails with `RegistryFull` when `capacity` entries are waiting, after
    /// first evicting expired ones.
    pub fn register<S>(&self, stream: S, metadata: StreamMetadata) -> Result<StreamId>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        if !self.reserve_slot() {
            self.sweep_expired();
            if !self.reserve_slot() {
                warn!(capacity = self.config.capacity, "stream registry full");
                return Err(TransferError::RegistryFull {
                    capacity: self.config.capacity,
                });
            }
        }

        let id = StreamId::random();
        debug!(stream_id = %id, filename = %metadata.filename, "registered inbound stream");
        self.entries.insert(
            id,
            Entry {
                stream: Mutex::new(stream.boxed()),
                metadata,
                registered_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Claim and remove an entry. Of two concurrent calls with the same id
    /// exactly one succeeds; the other gets `NotFound`.
    pub fn take(&self, id: StreamId) -> Result<(InboundStream, StreamMetadata)> {
        let (_, entry) = self
            .entries
            .remove(&id)
            .ok_or_else(|| TransferError::not_found("stream", id))?;
        self.count.fetch_sub(1, Ordering::SeqCst);

        debug!(
            stream_id = %id,
            waited_ms = entry.registered_at.elapsed().as_millis() as u64,
            "claimed inbound stream"
        );
        let stream = entry.stream.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok((stream, entry.metadata))
    }

    /// Drop entries older than the TTL. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.config.ttl else {
            return 0;
        };
        let mut evicted = 0;
        self.entries.retain(|id, entry| {
            let expired = entry.registered_at.elapsed() >= ttl;
            if expired {
                warn!(stream_id = %id, filename = %entry.metadata.filename, "unclaimed stream expired");
                evicted += 1;
            }
            !expired
        });
        if evicted > 0 {
            self.count.fetch_sub(evicted, Ordering::SeqCst);
        }
        evicted
    }

    /// Sweep every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.sweep_expired();
                if evicted > 0 {
                    info!(evicted, remaining = registry.len(), "stream registry sweep");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> RegistryConfig {
        self.config
    }

    fn reserve_slot(&self) -> bool {
        let capacity = self.config.capacity;
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn meta(name: &str) -> StreamMetadata {
        StreamMetadata {
            field_name: Some("file".into()),
            filename: name.into(),
            mimetype: "application/octet-stream".into(),
        }
    }

    fn bytes_stream(data: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        futures::stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    #[tokio::test]
    async fn take_returns_stream_and_metadata_once() {
        let registry = StreamRegistry::default();
        let id = registry.register(bytes_stream(b"abc"), meta("a.bin")).unwrap();
        assert_eq!(registry.len(), 1);

        let (stream, metadata) = registry.take(id).unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"abc");
        assert_eq!(metadata.filename, "a.bin");

        assert!(matches!(registry.take(id), Err(TransferError::NotFound { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_takes_have_one_winner() {
        for _ in 0..50 {
            let registry = Arc::new(StreamRegistry::default());
            let id = registry.register(bytes_stream(b"x"), meta("x")).unwrap();

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let registry = Arc::clone(&registry);
                    tokio::spawn(async move { registry.take(id).is_ok() })
                })
                .collect();

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = StreamRegistry::new(RegistryConfig {
            ttl: None,
            capacity: 2,
        });
        registry.register(bytes_stream(b"1"), meta("1")).unwrap();
        let second = registry.register(bytes_stream(b"2"), meta("2")).unwrap();

        let err = registry.register(bytes_stream(b"3"), meta("3")).unwrap_err();
        assert!(matches!(err, TransferError::RegistryFull { capacity: 2 }));

        registry.take(second).unwrap();
        registry.register(bytes_stream(b"3"), meta("3")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept() {
        let registry = StreamRegistry::new(RegistryConfig {
            ttl: Some(Duration::from_secs(60)),
            capacity: 8,
        });
        let old = registry.register(bytes_stream(b"old"), meta("old")).unwrap();
        tokio::time::advance(Duration::from_secs(45)).await;
        let young = registry.register(bytes_stream(b"young"), meta("young")).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.take(old).is_err());
        assert!(registry.take(young).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn full_registry_evicts_expired_before_refusing() {
        let registry = StreamRegistry::new(RegistryConfig {
            ttl: Some(Duration::from_secs(10)),
            capacity: 1,
        });
        registry.register(bytes_stream(b"stale"), meta("stale")).unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        registry.register(bytes_stream(b"fresh"), meta("fresh")).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_and_stops_with_registry() {
        let registry = Arc::new(StreamRegistry::new(RegistryConfig {
            ttl: Some(Duration::from_secs(10)),
            capacity: 8,
        }));
        registry.register(bytes_stream(b"idle"), meta("idle")).unwrap();
        let sweeper = registry.spawn_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(registry.len(), 0);

        drop(registry);
        let finished = tokio::time::timeout(Duration::from_secs(30), sweeper).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }

    #[test]
    fn stream_id_parsing() {
        let id = StreamId::random();
        assert_eq!(id.to_string().parse::<StreamId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<StreamId>(),
            Err(TransferError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn byte_channel_applies_backpressure() {
        let (tx, mut stream) = crate::pump::byte_channel(1);
        tx.send(Ok(Bytes::from_static(b"one"))).await.unwrap();
        assert!(tx.try_send(Ok(Bytes::from_static(b"two"))).is_err());

        assert_eq!(stream.next().await.unwrap().unwrap(), "one");
        assert!(tx.try_send(Ok(Bytes::from_static(b"two"))).is_ok());
    }
}
