//! In-memory transactional large-object store.
//!
//! Behaves like a tiny PostgreSQL large-object facility: objects created in a
//! transaction become visible only on commit, connections are leased from a
//! bounded pool, and an unresolved transaction rolls back when dropped.
//!
//! Useful for tests and for running the server without a database. Lease,
//! commit and rollback counters make connection leaks observable, and a few
//! fault knobs (failing reads, slow reads, failing commits, denied objects)
//! reproduce the failure paths of a real store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Result, TransferError};
use crate::store::{AccessMode, LargeObjectTransaction, LoFd, Oid, TransactionSource};

const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of the store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Transactions currently holding a connection
    pub leased: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_read_after: Option<usize>,
    read_latency: Duration,
    fail_commits: bool,
    denied: HashSet<Oid>,
}

struct Shared {
    objects: Mutex<HashMap<Oid, Vec<u8>>>,
    faults: Mutex<Faults>,
    next_oid: AtomicU32,
    connections: Arc<Semaphore>,
    acquire_timeout: Duration,
    leased: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store. Cloning shares the same objects and pool.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_pool(DEFAULT_MAX_CONNECTIONS, DEFAULT_ACQUIRE_TIMEOUT)
    }

    /// Store with `max_connections` leases; `begin` waits up to
    /// `acquire_timeout` for a free one.
    pub fn with_pool(max_connections: usize, acquire_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                objects: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                next_oid: AtomicU32::new(16384),
                connections: Arc::new(Semaphore::new(max_connections)),
                acquire_timeout,
                leased: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }),
        }
    }

    /// Store an already committed object, bypassing transactions.
    pub fn insert_committed(&self, data: Vec<u8>) -> Oid {
        let oid = self.allocate_oid();
        lock(&self.shared.objects).insert(oid, data);
        oid
    }

    /// Committed content of an object.
    pub fn object(&self, oid: Oid) -> Option<Vec<u8>> {
        lock(&self.shared.objects).get(&oid).cloned()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.shared.objects).len()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            leased: self.shared.leased.load(Ordering::SeqCst),
            commits: self.shared.commits.load(Ordering::SeqCst),
            rollbacks: self.shared.rollbacks.load(Ordering::SeqCst),
        }
    }

    /// Every read after the first `n` of a transaction fails.
    pub fn fail_reads_after(&self, n: usize) {
        lock(&self.shared.faults).fail_read_after = Some(n);
    }

    /// Sleep before every read.
    pub fn read_latency(&self, latency: Duration) {
        lock(&self.shared.faults).read_latency = latency;
    }

    pub fn fail_commits(&self, fail: bool) {
        lock(&self.shared.faults).fail_commits = fail;
    }

    /// Opening `oid` fails with a permission error.
    pub fn deny(&self, oid: Oid) {
        lock(&self.shared.faults).denied.insert(oid);
    }

    /// Refuse all further connections, like an unreachable server.
    pub fn shut_down(&self) {
        self.shared.connections.close();
    }

    fn allocate_oid(&self) -> Oid {
        loop {
            // zero is skipped after a wrap-around
            if let Ok(oid) = Oid::new(self.shared.next_oid.fetch_add(1, Ordering::SeqCst)) {
                return oid;
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionSource for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let permit = tokio::time::timeout(
            self.shared.acquire_timeout,
            Arc::clone(&self.shared.connections).acquire_owned(),
        )
        .await
        .map_err(|_| TransferError::pool_exhausted("timed out waiting for a connection"))?
        .map_err(|_| TransferError::connect_failed("memory store is shut down"))?;

        self.shared.leased.fetch_add(1, Ordering::SeqCst);
        debug!("memory transaction started");

        Ok(MemoryTransaction {
            store: self.clone(),
            _permit: permit,
            staged: HashMap::new(),
            open: HashMap::new(),
            next_fd: 0,
            reads: 0,
            resolved: false,
        })
    }

    fn label(&self) -> String {
        "memory".to_string()
    }
}

struct OpenObject {
    oid: Oid,
    mode: AccessMode,
    pos: usize,
}

/// Transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    store: MemoryStore,
    _permit: OwnedSemaphorePermit,
    staged: HashMap<Oid, Vec<u8>>,
    open: HashMap<i32, OpenObject>,
    next_fd: i32,
    reads: usize,
    resolved: bool,
}

impl MemoryTransaction {
    fn descriptor(&mut self, fd: LoFd) -> Result<&mut OpenObject> {
        self.open
            .get_mut(&fd.0)
            .ok_or_else(|| TransferError::store(format!("invalid large-object descriptor: {}", fd.0)))
    }

    fn with_content<R>(&self, oid: Oid, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if let Some(data) = self.staged.get(&oid) {
            return Ok(f(data));
        }
        let objects = lock(&self.store.shared.objects);
        objects
            .get(&oid)
            .map(|data| f(data))
            .ok_or_else(|| TransferError::not_found("large object", oid))
    }
}

#[async_trait]
impl LargeObjectTransaction for MemoryTransaction {
    async fn lo_open(&mut self, oid: Oid, mode: AccessMode) -> Result<LoFd> {
        if lock(&self.store.shared.faults).denied.contains(&oid) {
            return Err(TransferError::denied("large object", oid));
        }
        self.with_content(oid, |_| ())?;
        if mode == AccessMode::Write && !self.staged.contains_key(&oid) {
            let current = self.with_content(oid, <[u8]>::to_vec)?;
            self.staged.insert(oid, current);
        }

        self.next_fd += 1;
        self.open.insert(self.next_fd, OpenObject { oid, mode, pos: 0 });
        Ok(LoFd(self.next_fd))
    }

    async fn lo_size(&mut self, fd: LoFd) -> Result<u64> {
        let oid = self.descriptor(fd)?.oid;
        self.with_content(oid, |data| data.len() as u64)
    }

    async fn lo_read(&mut self, fd: LoFd, max: usize) -> Result<Bytes> {
        let (fail_after, latency) = {
            let faults = lock(&self.store.shared.faults);
            (faults.fail_read_after, faults.read_latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail_after.is_some_and(|n| self.reads >= n) {
            return Err(TransferError::store("injected read failure"));
        }
        self.reads += 1;

        let (oid, pos) = {
            let open = self.descriptor(fd)?;
            if open.mode != AccessMode::Read {
                return Err(TransferError::store("descriptor not open for reading"));
            }
            (open.oid, open.pos)
        };
        let chunk = self.with_content(oid, |data| {
            let start = pos.min(data.len());
            let end = pos.saturating_add(max).min(data.len());
            Bytes::copy_from_slice(&data[start..end])
        })?;
        self.descriptor(fd)?.pos += chunk.len();
        Ok(chunk)
    }

    async fn lo_create(&mut self) -> Result<Oid> {
        let oid = self.store.allocate_oid();
        self.staged.insert(oid, Vec::new());
        Ok(oid)
    }

    async fn lo_write(&mut self, fd: LoFd, data: &[u8]) -> Result<()> {
        let (oid, mode) = {
            let open = self.descriptor(fd)?;
            (open.oid, open.mode)
        };
        if mode != AccessMode::Write {
            return Err(TransferError::store("descriptor not open for writing"));
        }
        let content = self
            .staged
            .get_mut(&oid)
            .ok_or_else(|| TransferError::not_found("large object", oid))?;
        content.extend_from_slice(data);
        self.descriptor(fd)?.pos += data.len();
        Ok(())
    }

    async fn lo_close(&mut self, fd: LoFd) -> Result<()> {
        self.open
            .remove(&fd.0)
            .map(|_| ())
            .ok_or_else(|| TransferError::store(format!("invalid large-object descriptor: {}", fd.0)))
    }

    async fn commit(mut self) -> Result<()> {
        self.resolved = true;
        if lock(&self.store.shared.faults).fail_commits {
            self.store.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(TransferError::store("injected commit failure"));
        }
        let staged = std::mem::take(&mut self.staged);
        lock(&self.store.shared.objects).extend(staged);
        self.store.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.resolved = true;
        self.store.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.resolved {
            debug!("memory transaction dropped unresolved, rolling back");
            self.store.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.store.shared.leased.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_objects_appear_only_on_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let oid = tx.lo_create().await.unwrap();
        let fd = tx.lo_open(oid, AccessMode::Write).await.unwrap();
        tx.lo_write(fd, b"payload").await.unwrap();
        tx.lo_close(fd).await.unwrap();

        assert!(store.object(oid).is_none());
        tx.commit().await.unwrap();
        assert_eq!(store.object(oid).unwrap(), b"payload");
        assert_eq!(store.stats(), MemoryStats { leased: 0, commits: 1, rollbacks: 0 });
    }

    #[tokio::test]
    async fn rollback_discards_created_objects() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let oid = tx.lo_create().await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.object(oid).is_none());
        assert_eq!(store.stats().rollbacks, 1);
        assert_eq!(store.stats().leased, 0);
    }

    #[tokio::test]
    async fn dropping_unresolved_transaction_rolls_back() {
        let store = MemoryStore::new();
        let tx = store.begin().await.unwrap();
        assert_eq!(store.stats().leased, 1);

        drop(tx);

        assert_eq!(store.stats(), MemoryStats { leased: 0, commits: 0, rollbacks: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out() {
        let store = MemoryStore::with_pool(1, Duration::from_millis(100));
        let _held = store.begin().await.unwrap();

        let err = store.begin().await.err().unwrap();
        assert!(matches!(err, TransferError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn shut_down_store_refuses_connections() {
        let store = MemoryStore::new();
        store.shut_down();
        let err = store.begin().await.err().unwrap();
        assert!(matches!(err, TransferError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn denied_object_cannot_be_opened() {
        let store = MemoryStore::new();
        let oid = store.insert_committed(vec![1, 2, 3]);
        store.deny(oid);

        let mut tx = store.begin().await.unwrap();
        let err = tx.lo_open(oid, AccessMode::Read).await.unwrap_err();
        assert!(matches!(err, TransferError::Denied { .. }));
    }
}
