// ABOUTME: Library root for warehouse-replicator
// ABOUTME: Incremental MySQL-to-warehouse table sync with watermarks and schema reconciliation

pub mod commands;
pub mod config;
pub mod error;
pub mod retry;
pub mod schema;
pub mod source;
pub mod state;
pub mod sync;
pub mod transform;
pub mod utils;
pub mod value;
pub mod warehouse;

pub use error::{Result, SyncError};
