//! Database layer - connection pools and the large-object store
//!
//! # Design Principles
//!
//! - One pool per configuration identity, created lazily, never replaced
//! - Every transfer runs in its own transaction on one leased connection
//! - Dropping an unresolved transaction rolls back and returns the connection

pub mod directory;
pub mod large_object;
pub mod pool;

pub use directory::PgDirectory;
pub use large_object::{PgLargeObjectTx, PgStore};
pub use pool::{PoolRegistry, PoolStats};
