//! Backing-store seam: transactions and the large-object sub-API.
//!
//! The engine never talks to a database directly. A [`TransactionSource`]
//! leases a connection and opens a transaction on it; the returned
//! [`LargeObjectTransaction`] exposes the large-object calls scoped to that
//! connection. `blobrelay-server` implements these traits on top of sqlx,
//! [`crate::memory::MemoryStore`] implements them in process.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// Identifier of a large object, assigned by the store on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(u32);

impl Oid {
    /// Wrap a raw OID. Zero is `InvalidOid` in PostgreSQL and is rejected.
    pub fn new(raw: u32) -> Result<Self> {
        if raw == 0 {
            return Err(TransferError::invalid_input("OID must be a positive integer"));
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl FromStr for Oid {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        let raw: u32 = s
            .trim()
            .parse()
            .map_err(|_| TransferError::invalid_input(format!("invalid OID format: '{s}'")))?;
        Self::new(raw)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mode a large object is opened in. A handle is open in exactly one mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    /// `INV_READ` / `INV_WRITE` flags from `libpq-fs.h`.
    pub fn flags(self) -> i32 {
        match self {
            Self::Read => 0x0004_0000,
            Self::Write => 0x0002_0000,
        }
    }
}

/// Descriptor of an open large object, valid only inside its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoFd(pub i32);

/// Leases a connection and opens a transaction on it.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    type Tx: LargeObjectTransaction;

    /// Check out a connection and issue `BEGIN`.
    ///
    /// Fails with `PoolExhausted` when no connection frees up in time and
    /// `ConnectFailed` when the store is unreachable.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Short label for logs (`host:port/database`, `memory`, ...).
    fn label(&self) -> String;
}

/// One open transaction holding one leased connection.
///
/// `commit` and `rollback` consume the transaction and hand the connection
/// back to its pool before returning, whatever their result. Dropping a
/// transaction that was never resolved must roll it back and release the
/// connection.
#[async_trait]
pub trait LargeObjectTransaction: Send + 'static {
    /// Open an existing object. Absent objects fail with `NotFound`,
    /// permission failures with `Denied`.
    async fn lo_open(&mut self, oid: Oid, mode: AccessMode) -> Result<LoFd>;

    /// Total length in bytes; leaves the read position at the start.
    async fn lo_size(&mut self, fd: LoFd) -> Result<u64>;

    /// Read up to `max` bytes. An empty result is EOF.
    async fn lo_read(&mut self, fd: LoFd, max: usize) -> Result<Bytes>;

    /// Create an empty object and return its OID.
    async fn lo_create(&mut self) -> Result<Oid>;

    /// Append `data` at the current write position.
    async fn lo_write(&mut self, fd: LoFd, data: &[u8]) -> Result<()>;

    async fn lo_close(&mut self, fd: LoFd) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
