//! Lookup of named stores for the HTTP layer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use blobrelay_core::{MemoryStore, StoreSection, TransactionSource, TransferError};

use crate::db::PoolStats;

/// Maps the `{store}` segment of a route to a transactional store.
#[async_trait]
pub trait StoreDirectory: Send + Sync + 'static {
    type Store: TransactionSource + 'static;

    /// The store called `name`; `NotFound` if it is not configured.
    fn resolve(&self, name: &str) -> Result<Self::Store, TransferError>;

    fn names(&self) -> Vec<String>;

    fn pool_stats(&self) -> Vec<PoolStats> {
        Vec::new()
    }

    /// Replace the store catalog. Existing pools are kept.
    fn reload(&self, _stores: &BTreeMap<String, StoreSection>) {}

    /// Release every pool. Called once at process teardown.
    async fn shutdown(&self) {}
}

/// In-memory stores, one per name. No database needed.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    stores: BTreeMap<String, MemoryStore>,
}

impl MemoryDirectory {
    /// A fresh, empty [`MemoryStore`] for each name.
    pub fn new<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        Self {
            stores: names
                .into_iter()
                .map(|name| (name.into(), MemoryStore::new()))
                .collect(),
        }
    }

    pub fn with_store(mut self, name: impl Into<String>, store: MemoryStore) -> Self {
        self.stores.insert(name.into(), store);
        self
    }

    pub fn store(&self, name: &str) -> Option<&MemoryStore> {
        self.stores.get(name)
    }
}

#[async_trait]
impl StoreDirectory for MemoryDirectory {
    type Store = MemoryStore;

    fn resolve(&self, name: &str) -> Result<MemoryStore, TransferError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| TransferError::not_found("store", name))
    }

    fn names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }
}
