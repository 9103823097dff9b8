//! Command implementations for the blobrelay CLI

pub mod config;
pub mod serve;
pub mod transfer;

pub use config::run_config;
pub use serve::run_serve;
pub use transfer::{run_get, run_put};
