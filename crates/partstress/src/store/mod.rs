//! Row-store client abstraction.
//!
//! The harness only needs two capabilities from the store: hand out a
//! dedicated connection per worker, and execute statements. Both are traits so
//! the same orchestration runs against a real MySQL-protocol server
//! ([`MySqlStore`]) or the in-process simulation ([`MemoryStore`]) used by the
//! test suite and `--dry-run`.

mod memory;
mod mysql;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{MemoryStore, StatementRecord};
pub use mysql::MySqlStore;

/// A connection owned by exactly one worker for its whole lifetime.
#[async_trait]
pub trait StoreConnection: Send {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str) -> Result<u64>;
}

/// Shared handle to the store.
#[async_trait]
pub trait RowStoreClient: Send + Sync {
    /// Acquire a dedicated connection.
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>>;

    /// Execute an administrative statement on any available connection.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a `SELECT COUNT(*)` style query and return the single value.
    async fn fetch_count(&self, sql: &str) -> Result<i64>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}
