//! Exactly-once resolution of a transfer's transaction.
//!
//! # Lifecycle
//!
//! ```text
//! Init ─▶ Connecting ─▶ TxOpen ─▶ Streaming ─▶ Resolving ─▶ Closed(outcome)
//!              │            │                      ▲
//!              │            └──────────────────────┘   open failed: roll back first
//!              └─────────────────────────────────────▶ Closed   pool failure
//! ```
//!
//! EOF, a stream error and a client disconnect all end a transfer by calling
//! [`TransactionGuard::resolve`]. Only the first call reaches the store; the
//! transaction is moved out of the guard (one-shot), so every later call is a
//! no-op returning [`Resolution::AlreadyResolved`]. Commit/rollback consume
//! the transaction, which hands its connection back to the pool whatever the
//! result, so release also happens exactly once.
//!
//! A guard dropped before resolution (the owning task was cancelled) lets the
//! transaction's own drop roll back and release.

use std::fmt;

use tracing::{debug, info, warn};

use crate::error::{Outcome, Result, TransferError};
use crate::handle::{LargeObjectHandle, LargeObjectSink};
use crate::store::{LargeObjectTransaction, Oid, TransactionSource};

/// Where a transfer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Connecting,
    TxOpen,
    Streaming,
    Resolving,
    Closed(Outcome),
}

impl TransferState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, TxOpen)
                | (Connecting, Closed(_))
                | (TxOpen, Streaming)
                | (TxOpen, Resolving)
                | (Streaming, Resolving)
                | (Resolving, Closed(_))
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Connecting => f.write_str("connecting"),
            Self::TxOpen => f.write_str("tx_open"),
            Self::Streaming => f.write_str("streaming"),
            Self::Resolving => f.write_str("resolving"),
            Self::Closed(outcome) => write!(f, "closed({outcome})"),
        }
    }
}

/// How to end the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    /// Roll back; `cause` is the outcome the transfer closes with.
    Rollback { cause: Outcome },
}

/// What a call to [`TransactionGuard::resolve`] did.
#[derive(Debug)]
pub enum Resolution {
    Committed,
    RolledBack,
    /// COMMIT or ROLLBACK itself failed. The connection was still released.
    Failed {
        decision: Decision,
        error: TransferError,
    },
    /// An earlier call already resolved the transaction.
    AlreadyResolved,
}

impl Resolution {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// One-shot latch around one transaction and its connection.
pub struct TransactionGuard<T: LargeObjectTransaction> {
    tx: Option<T>,
    label: String,
    state: TransferState,
}

impl<T: LargeObjectTransaction> TransactionGuard<T> {
    /// Lease a connection from `source` and open a transaction on it.
    pub async fn begin<S>(source: &S, label: impl Into<String>) -> Result<Self>
    where
        S: TransactionSource<Tx = T> + ?Sized,
    {
        let label = label.into();
        let mut state = TransferState::Init;
        advance(&label, &mut state, TransferState::Connecting);

        match source.begin().await {
            Ok(tx) => {
                advance(&label, &mut state, TransferState::TxOpen);
                Ok(Self {
                    tx: Some(tx),
                    label,
                    state,
                })
            }
            Err(e) => {
                advance(&label, &mut state, TransferState::Closed(e.outcome()));
                warn!(transfer = %label, store = %source.label(), error = %e, "could not open transaction");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    /// The open transaction; fails once the guard has resolved.
    pub fn transaction(&mut self) -> Result<&mut T> {
        self.tx
            .as_mut()
            .ok_or_else(|| TransferError::store("transaction already resolved"))
    }

    /// Open `oid` for reading inside the guarded transaction.
    ///
    /// The transfer is streaming from here on; the handle borrows the guard
    /// and must be closed (or dropped) before [`resolve`](Self::resolve).
    pub async fn open_for_read(&mut self, oid: Oid) -> Result<LargeObjectHandle<'_, T>> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| TransferError::store("transaction already resolved"))?;
        let handle = LargeObjectHandle::open_for_read(tx, oid).await?;
        advance(&self.label, &mut self.state, TransferState::Streaming);
        Ok(handle)
    }

    /// Create a new object and open a write sink on it.
    pub async fn create_for_write(&mut self) -> Result<LargeObjectSink<'_, T>> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| TransferError::store("transaction already resolved"))?;
        let sink = LargeObjectSink::create(tx).await?;
        advance(&self.label, &mut self.state, TransferState::Streaming);
        Ok(sink)
    }

    /// Commit or roll back. Only the first call has any effect.
    ///
    /// Failures of COMMIT/ROLLBACK are logged and reported in the returned
    /// [`Resolution`], never raised: the connection is released either way.
    pub async fn resolve(&mut self, decision: Decision) -> Resolution {
        let Some(tx) = self.tx.take() else {
            debug!(transfer = %self.label, ?decision, "transaction already resolved");
            return Resolution::AlreadyResolved;
        };
        advance(&self.label, &mut self.state, TransferState::Resolving);

        let (result, outcome) = match decision {
            Decision::Commit => (tx.commit().await, Outcome::Success),
            Decision::Rollback { cause } => (tx.rollback().await, cause),
        };

        let resolution = match result {
            Ok(()) if decision == Decision::Commit => Resolution::Committed,
            Ok(()) => Resolution::RolledBack,
            Err(error) => {
                warn!(transfer = %self.label, ?decision, error = %error, "transaction cleanup error");
                Resolution::Failed { decision, error }
            }
        };

        let outcome = match resolution {
            Resolution::Failed {
                decision: Decision::Commit,
                ..
            } => Outcome::StreamError,
            _ => outcome,
        };
        advance(&self.label, &mut self.state, TransferState::Closed(outcome));
        info!(transfer = %self.label, %outcome, "transaction resolved, connection released");

        resolution
    }
}

impl<T: LargeObjectTransaction> Drop for TransactionGuard<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(
                transfer = %self.label,
                state = %self.state,
                "transfer dropped before resolution; rolling back on release"
            );
        }
    }
}

fn advance(label: &str, state: &mut TransferState, next: TransferState) {
    if !state.can_advance_to(next) {
        warn!(transfer = %label, from = %state, to = %next, "unexpected transfer state change");
    }
    debug!(transfer = %label, from = %state, to = %next, "transfer state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStats, MemoryStore};
    use std::time::Duration;

    #[test]
    fn legal_transitions() {
        use TransferState::*;
        assert!(Init.can_advance_to(Connecting));
        assert!(Connecting.can_advance_to(Closed(Outcome::PoolExhausted)));
        assert!(TxOpen.can_advance_to(Resolving));
        assert!(Streaming.can_advance_to(Resolving));
        assert!(Resolving.can_advance_to(Closed(Outcome::Success)));

        assert!(!Init.can_advance_to(Streaming));
        assert!(!TxOpen.can_advance_to(Closed(Outcome::NotFound)));
        assert!(!Closed(Outcome::Success).can_advance_to(Resolving));
    }

    #[tokio::test]
    async fn only_first_resolve_reaches_the_store() {
        let store = MemoryStore::new();
        let oid = store.insert_committed(b"abc".to_vec());
        let mut guard = TransactionGuard::begin(&store, "test").await.unwrap();
        let handle = guard.open_for_read(oid).await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(guard.state(), TransferState::Streaming);

        assert!(guard.resolve(Decision::Commit).await.is_committed());
        let second = guard
            .resolve(Decision::Rollback {
                cause: Outcome::Cancelled,
            })
            .await;

        assert!(matches!(second, Resolution::AlreadyResolved));
        assert_eq!(guard.state(), TransferState::Closed(Outcome::Success));
        assert_eq!(store.stats(), MemoryStats { leased: 0, commits: 1, rollbacks: 0 });
    }

    #[tokio::test]
    async fn failed_commit_still_releases() {
        let store = MemoryStore::new();
        store.fail_commits(true);
        let mut guard = TransactionGuard::begin(&store, "test").await.unwrap();

        let resolution = guard.resolve(Decision::Commit).await;

        assert!(matches!(
            resolution,
            Resolution::Failed {
                decision: Decision::Commit,
                ..
            }
        ));
        assert_eq!(guard.state(), TransferState::Closed(Outcome::StreamError));
        assert_eq!(store.stats().leased, 0);
    }

    #[tokio::test]
    async fn rollback_records_cause() {
        let store = MemoryStore::new();
        let mut guard = TransactionGuard::begin(&store, "test").await.unwrap();

        let resolution = guard
            .resolve(Decision::Rollback {
                cause: Outcome::NotFound,
            })
            .await;

        assert!(matches!(resolution, Resolution::RolledBack));
        assert_eq!(guard.state(), TransferState::Closed(Outcome::NotFound));
        assert!(guard.transaction().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pool_failure_never_opens_a_transaction() {
        let store = MemoryStore::with_pool(1, Duration::from_millis(10));
        let _held = store.begin().await.unwrap();

        let err = TransactionGuard::begin(&store, "test").await.err().unwrap();

        assert_eq!(err.outcome(), Outcome::PoolExhausted);
        assert_eq!(store.stats().leased, 1);
    }

    #[tokio::test]
    async fn failed_open_keeps_transaction_for_rollback() {
        let store = MemoryStore::new();
        let mut guard = TransactionGuard::begin(&store, "test").await.unwrap();

        let err = guard
            .open_for_read(Oid::new(999999).unwrap())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::NotFound { .. }));
        assert_eq!(guard.state(), TransferState::TxOpen);

        guard
            .resolve(Decision::Rollback {
                cause: err.outcome(),
            })
            .await;
        assert_eq!(guard.state(), TransferState::Closed(Outcome::NotFound));
        assert_eq!(store.stats(), MemoryStats { leased: 0, commits: 0, rollbacks: 1 });
    }

    #[tokio::test]
    async fn dropped_guard_rolls_back() {
        let store = MemoryStore::new();
        let guard = TransactionGuard::begin(&store, "test").await.unwrap();
        drop(guard);

        assert_eq!(store.stats(), MemoryStats { leased: 0, commits: 0, rollbacks: 1 });
    }
}
