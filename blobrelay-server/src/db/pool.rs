//! Database connection pool management
//!
//! One sqlx `PgPool` per distinct [`ConfigIdentity`], created lazily on
//! first use and kept for the life of the process. Reconfiguration never
//! replaces a pool; only [`PoolRegistry::drain_all`] at shutdown closes them.

use std::env;

use blobrelay_core::{ConfigIdentity, StoreSection};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgPool};
use tracing::{debug, info, warn};

/// Per-pool counters for health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub identity: String,
    pub size: u32,
    pub idle: usize,
    pub closed: bool,
}

/// Lazily populated map from configuration identity to pool.
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<ConfigIdentity, PgPool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `section`'s identity, creating it on first use.
    ///
    /// Creation does not connect; the first checkout does.
    pub fn get_or_create(&self, section: &StoreSection) -> PgPool {
        let identity = section.identity();
        if let Some(pool) = self.pools.get(&identity) {
            return pool.clone();
        }

        match self.pools.entry(identity) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let pool = create_pool(entry.key(), section);
                info!(
                    store = %entry.key(),
                    max_connections = section.max_connections,
                    "created connection pool"
                );
                entry.insert(pool.clone());
                pool
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .pools
            .iter()
            .map(|entry| PoolStats {
                identity: entry.key().to_string(),
                size: entry.value().size(),
                idle: entry.value().num_idle(),
                closed: entry.value().is_closed(),
            })
            .collect();
        stats.sort_by(|a, b| a.identity.cmp(&b.identity));
        stats
    }

    /// Close every pool, waiting for leased connections to come back.
    pub async fn drain_all(&self) {
        let pools: Vec<(ConfigIdentity, PgPool)> = self
            .pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (identity, pool) in pools {
            pool.close().await;
            info!(store = %identity, "connection pool drained");
        }
    }
}

fn connect_options(identity: &ConfigIdentity) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&identity.host)
        .port(identity.port)
        .database(&identity.database)
        .username(&identity.user)
        .application_name("blobrelay");

    match env::var(&identity.password_env) {
        Ok(password) => options.password(&password),
        Err(_) => {
            debug!(store = %identity, var = %identity.password_env, "password variable not set");
            options
        }
    }
}

/// Build a lazy pool whose idle connections are health-checked on checkout.
///
/// A connection that broke while idle is logged and discarded, and the pool
/// opens a fresh one instead of handing out a dead socket.
fn create_pool(identity: &ConfigIdentity, section: &StoreSection) -> PgPool {
    let label = identity.to_string();

    PgPoolOptions::new()
        .max_connections(section.max_connections)
        .acquire_timeout(section.acquire_timeout())
        .test_before_acquire(false)
        .before_acquire(move |conn, meta| {
            let label = label.clone();
            Box::pin(async move {
                match conn.ping().await {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        warn!(
                            store = %label,
                            idle_ms = meta.idle_for.as_millis() as u64,
                            error = %e,
                            "discarding broken idle connection"
                        );
                        Ok(false)
                    }
                }
            })
        })
        .connect_lazy_with(connect_options(identity))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(host: &str) -> StoreSection {
        StoreSection {
            host: host.to_string(),
            ..StoreSection::default()
        }
    }

    #[tokio::test]
    async fn one_pool_per_identity() {
        let registry = PoolRegistry::new();

        registry.get_or_create(&section("db-a"));
        registry.get_or_create(&section("db-a"));
        registry.get_or_create(&section("db-b"));

        assert_eq!(registry.len(), 2);
        let stats = registry.stats();
        assert_eq!(stats[0].identity, "blobrelay@db-a:5432/filesdb");
        assert_eq!(stats[0].size, 0);
    }

    #[tokio::test]
    async fn drain_closes_but_keeps_entries() {
        let registry = PoolRegistry::new();
        let pool = registry.get_or_create(&section("db-a"));

        registry.drain_all().await;

        assert!(pool.is_closed());
        assert_eq!(registry.len(), 1);
        assert!(registry.stats()[0].closed);
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn pool_acquires_connection() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = PgPool::connect(&url).await.expect("pool creation failed");

        let result: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query failed");

        assert_eq!(result.0, 1);
    }
}
