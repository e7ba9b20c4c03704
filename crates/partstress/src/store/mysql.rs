//! MySQL-protocol store backed by `sqlx::MySqlPool`.
//!
//! Statements are sent through the text protocol (`sqlx::raw_sql`) rather than
//! as prepared statements: every INSERT is a different literal batch, and DDL
//! such as `ALTER TABLE ... DROP PARTITION` does not benefit from preparation.
//!
//! The pool is sized so every worker can hold its own `PoolConnection` for
//! the whole run, with two spare connections for the orchestrator's
//! administrative statements.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::{HarnessError, Result};
use crate::store::{RowStoreClient, StoreConnection};

pub struct MySqlStore {
    pool: MySqlPool,
    url: String,
}

impl MySqlStore {
    /// Open a pool against the configured server.
    ///
    /// The pool opens connections lazily; this only fails if the first
    /// connection cannot be established.
    pub async fn connect(config: &StoreConfig, max_connections: u32) -> Result<Self> {
        let url = config.redacted_url();
        info!(url = %url, max_connections, "Connecting to store");

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.connection_url())
            .await?;

        Ok(Self { pool, url })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RowStoreClient for MySqlStore {
    async fn acquire(&self) -> Result<Box<dyn StoreConnection>> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| HarnessError::Connection(e.to_string()))?;
        Ok(Box::new(MySqlConnection { conn }))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let result = sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_count(&self, sql: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct MySqlConnection {
    conn: PoolConnection<MySql>,
}

#[async_trait]
impl StoreConnection for MySqlConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        // `raw_sql(..).execute(&mut *conn)` trips a higher-ranked `Executor`
        // bound inside `async_trait`; call the connection's impl directly.
        let result = Executor::execute(&mut *self.conn, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }
}
