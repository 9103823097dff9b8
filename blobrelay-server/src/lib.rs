//! blobrelay-server: PostgreSQL large-object store and HTTP surface
//!
//! Implements the core engine's store traits over sqlx, keeps one pool per
//! configured database identity, and exposes downloads, uploads and the
//! two-phase multipart handoff over axum.

pub mod db;
pub mod directory;
pub mod handoff;
pub mod http;

pub use db::{PgDirectory, PgStore, PoolRegistry, PoolStats};
pub use directory::{MemoryDirectory, StoreDirectory};
pub use handoff::{HandoffReceipt, HandoffTarget};
pub use http::{build_router, run_server, ApiError, AppState, ServerConfig, ServerError};
