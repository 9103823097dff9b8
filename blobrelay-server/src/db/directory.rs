//! Named PostgreSQL stores resolved through the pool registry.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use blobrelay_core::{StoreSection, TransferError};
use tracing::info;

use super::large_object::PgStore;
use super::pool::{PoolRegistry, PoolStats};
use crate::directory::StoreDirectory;

/// Store catalog from the `[stores.*]` config sections.
///
/// The catalog can be swapped at runtime; pools already created stay alive
/// and are reused by any store whose identity still matches.
pub struct PgDirectory {
    catalog: RwLock<BTreeMap<String, StoreSection>>,
    pools: PoolRegistry,
}

impl PgDirectory {
    pub fn new(stores: BTreeMap<String, StoreSection>) -> Self {
        Self {
            catalog: RwLock::new(stores),
            pools: PoolRegistry::new(),
        }
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    fn section(&self, name: &str) -> Option<StoreSection> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

#[async_trait]
impl StoreDirectory for PgDirectory {
    type Store = PgStore;

    fn resolve(&self, name: &str) -> Result<PgStore, TransferError> {
        let section = self
            .section(name)
            .ok_or_else(|| TransferError::not_found("store", name))?;
        Ok(PgStore::new(self.pools.get_or_create(&section), name))
    }

    fn names(&self) -> Vec<String> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    fn reload(&self, stores: &BTreeMap<String, StoreSection>) {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        *catalog = stores.clone();
        info!(stores = catalog.len(), pools = self.pools.len(), "store catalog reloaded");
    }

    async fn shutdown(&self) {
        self.pools.drain_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobrelay_core::TransactionSource;

    fn catalog(names: &[(&str, &str)]) -> BTreeMap<String, StoreSection> {
        names
            .iter()
            .map(|(name, host)| {
                (
                    name.to_string(),
                    StoreSection {
                        host: host.to_string(),
                        ..StoreSection::default()
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn stores_with_same_identity_share_a_pool() {
        let directory = PgDirectory::new(catalog(&[("main", "db"), ("archive", "db")]));

        let main = directory.resolve("main").unwrap();
        directory.resolve("archive").unwrap();

        assert_eq!(directory.pools().len(), 1);
        assert_eq!(main.label(), "main");
    }

    #[tokio::test]
    async fn unknown_store_is_not_found() {
        let directory = PgDirectory::new(BTreeMap::new());
        assert!(matches!(
            directory.resolve("nope"),
            Err(TransferError::NotFound { resource: "store", .. })
        ));
    }

    #[tokio::test]
    async fn reload_keeps_existing_pools() {
        let directory = PgDirectory::new(catalog(&[("main", "db-a")]));
        let before = directory.resolve("main").unwrap();

        directory.reload(&catalog(&[("main", "db-a"), ("new", "db-b")]));
        let after = directory.resolve("main").unwrap();
        directory.resolve("new").unwrap();

        assert_eq!(directory.names(), vec!["main".to_string(), "new".to_string()]);
        assert_eq!(directory.pools().len(), 2);
        assert!(!before.pool().is_closed());
        assert_eq!(after.pool().size(), before.pool().size());
    }
}
