//! PostgreSQL large objects over sqlx.
//!
//! Uses the server-side large-object functions (`lo_open`, `loread`,
//! `lowrite`, `lo_lseek64`, `lo_create`, `lo_close`) inside an explicit
//! transaction; descriptors are only valid until that transaction ends.

use async_trait::async_trait;
use blobrelay_core::{AccessMode, LargeObjectTransaction, LoFd, Oid, TransactionSource, TransferError};
use bytes::Bytes;
use sqlx::postgres::types::Oid as PgOid;
use sqlx::{PgPool, Postgres, Transaction};

const SEEK_SET: i32 = 0;
const SEEK_END: i32 = 2;

/// A named store backed by one pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    name: String,
}

impl PgStore {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionSource for PgStore {
    type Tx = PgLargeObjectTx;

    async fn begin(&self) -> Result<PgLargeObjectTx, TransferError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| begin_error(e, self.pool.size()))?;
        Ok(PgLargeObjectTx { tx })
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

/// An open transaction holding one pooled connection.
///
/// Dropping it unresolved rolls back and returns the connection.
pub struct PgLargeObjectTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LargeObjectTransaction for PgLargeObjectTx {
    async fn lo_open(&mut self, oid: Oid, mode: AccessMode) -> Result<LoFd, TransferError> {
        let fd: i32 = sqlx::query_scalar("SELECT lo_open($1, $2)")
            .bind(PgOid(oid.get()))
            .bind(mode.flags())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| object_error(e, oid))?;
        Ok(LoFd(fd))
    }

    async fn lo_size(&mut self, fd: LoFd) -> Result<u64, TransferError> {
        let end: i64 = sqlx::query_scalar("SELECT lo_lseek64($1, 0, $2)")
            .bind(fd.0)
            .bind(SEEK_END)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;
        sqlx::query_scalar::<_, i64>("SELECT lo_lseek64($1, 0, $2)")
            .bind(fd.0)
            .bind(SEEK_SET)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;

        u64::try_from(end).map_err(|_| TransferError::store(format!("negative large object size: {end}")))
    }

    async fn lo_read(&mut self, fd: LoFd, max: usize) -> Result<Bytes, TransferError> {
        let len = i32::try_from(max).unwrap_or(i32::MAX);
        let data: Vec<u8> = sqlx::query_scalar("SELECT loread($1, $2)")
            .bind(fd.0)
            .bind(len)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;
        Ok(Bytes::from(data))
    }

    async fn lo_create(&mut self) -> Result<Oid, TransferError> {
        let oid: PgOid = sqlx::query_scalar("SELECT lo_create(0)")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;
        Oid::new(oid.0)
    }

    async fn lo_write(&mut self, fd: LoFd, data: &[u8]) -> Result<(), TransferError> {
        let written: i32 = sqlx::query_scalar("SELECT lowrite($1, $2)")
            .bind(fd.0)
            .bind(data)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;

        if usize::try_from(written).ok() != Some(data.len()) {
            return Err(TransferError::store(format!(
                "short large object write: {written} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    async fn lo_close(&mut self, fd: LoFd) -> Result<(), TransferError> {
        sqlx::query_scalar::<_, i32>("SELECT lo_close($1)")
            .bind(fd.0)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn commit(self) -> Result<(), TransferError> {
        self.tx.commit().await.map_err(query_error)
    }

    async fn rollback(self) -> Result<(), TransferError> {
        self.tx.rollback().await.map_err(query_error)
    }
}

/// Map a checkout/BEGIN failure.
/// Map a failed `BEGIN` checkout.
///
/// sqlx retries refused connections until the acquire timeout and then
/// reports `PoolTimedOut`. With no connection open at all that means the
/// server is unreachable, not that the pool is busy.
fn begin_error(err: sqlx::Error, pool_size: u32) -> TransferError {
    match err {
        sqlx::Error::PoolTimedOut if pool_size == 0 => TransferError::connect_failed(
            "no connection could be established before the acquire timeout",
        ),
        other => acquire_error(other),
    }
}

pub(crate) fn acquire_error(err: sqlx::Error) -> TransferError {
    match err {
        sqlx::Error::PoolTimedOut => TransferError::pool_exhausted("timed out waiting for a connection"),
        sqlx::Error::PoolClosed => TransferError::connect_failed("connection pool is closed"),
        sqlx::Error::Io(e) => TransferError::connect_failed(e.to_string()),
        sqlx::Error::Tls(e) => TransferError::connect_failed(e.to_string()),
        sqlx::Error::Configuration(e) => TransferError::connect_failed(e.to_string()),
        sqlx::Error::Database(e) => TransferError::connect_failed(e.to_string()),
        other => TransferError::store(other.to_string()),
    }
}

/// Map a failure of a statement naming `oid`.
fn object_error(err: sqlx::Error, oid: Oid) -> TransferError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(mapped) = classify_object_error(db.code().as_deref(), db.message(), oid) {
            return mapped;
        }
    }
    query_error(err)
}

/// `undefined_object` and `insufficient_privilege`, plus older servers that
/// report a missing large object without a usable SQLSTATE.
fn classify_object_error(code: Option<&str>, message: &str, oid: Oid) -> Option<TransferError> {
    match code {
        Some("42704") => Some(TransferError::not_found("large object", oid)),
        Some("42501") => Some(TransferError::denied("large object", oid)),
        _ if message.contains("does not exist") => Some(TransferError::not_found("large object", oid)),
        _ => None,
    }
}

fn query_error(err: sqlx::Error) -> TransferError {
    match err {
        sqlx::Error::Io(e) => TransferError::Io { source: e },
        other => TransferError::store(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PoolRegistry;
    use blobrelay_core::{Outcome, StoreSection};
    use std::io;

    #[test]
    fn pool_errors_map_to_acquisition_outcomes() {
        assert_eq!(acquire_error(sqlx::Error::PoolTimedOut).outcome(), Outcome::PoolExhausted);
        assert_eq!(acquire_error(sqlx::Error::PoolClosed).outcome(), Outcome::ConnectFailed);
        assert_eq!(
            acquire_error(sqlx::Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused))).outcome(),
            Outcome::ConnectFailed
        );
    }

    #[test]
    fn timeout_on_an_empty_pool_is_a_connect_failure() {
        assert_eq!(begin_error(sqlx::Error::PoolTimedOut, 0).outcome(), Outcome::ConnectFailed);
        assert_eq!(begin_error(sqlx::Error::PoolTimedOut, 4).outcome(), Outcome::PoolExhausted);
        assert_eq!(begin_error(sqlx::Error::PoolClosed, 4).outcome(), Outcome::ConnectFailed);
    }

    #[tokio::test]
    async fn unreachable_server_fails_to_connect() {
        let registry = PoolRegistry::new();
        let section = StoreSection {
            host: "127.0.0.1".to_string(),
            port: 1,
            acquire_timeout_secs: 1,
            ..StoreSection::default()
        };
        let store = PgStore::new(registry.get_or_create(&section), "dead");

        match store.begin().await {
            Ok(_) => panic!("connected to a closed port"),
            Err(err) => assert_eq!(err.outcome(), Outcome::ConnectFailed),
        }
    }

    #[test]
    fn object_errors_by_sqlstate() {
        let oid: Oid = "42".parse().unwrap();
        let outcome = |code, message| classify_object_error(code, message, oid).map(|e| e.outcome());

        assert_eq!(
            outcome(Some("42704"), "large object 42 does not exist"),
            Some(Outcome::NotFound)
        );
        assert_eq!(
            outcome(Some("42501"), "permission denied for large object 42"),
            Some(Outcome::Denied)
        );
        assert_eq!(
            outcome(Some("XX000"), "large object 42 does not exist"),
            Some(Outcome::NotFound)
        );
        assert_eq!(outcome(None, "large object 42 does not exist"), Some(Outcome::NotFound));
        assert_eq!(outcome(Some("57014"), "canceling statement due to user request"), None);
    }

    #[test]
    fn mid_stream_errors_are_stream_errors() {
        let err = query_error(sqlx::Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)));
        assert_eq!(err.outcome(), Outcome::StreamError);
        assert_eq!(query_error(sqlx::Error::RowNotFound).outcome(), Outcome::StreamError);
    }
}
