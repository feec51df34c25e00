//! `(chain_id, name) → JSON` bookkeeping blobs.
//!
//! Subsystems persist small cursors here - the storage processor's last
//! stored block, the snapshot driver's last persisted block - and read them
//! back at startup.

use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;

use crate::error::{InfraError, Result};

/// Cache entry names used by the pipeline.
pub mod names {
    /// Storage processor's highest committed block.
    pub const STORED_BLOCK: &str = "storage.blockNumber";
    /// Snapshot driver's last persisted block.
    pub const PERSISTED_BLOCK: &str = "snapshot.lastPersistedBlock";
}

/// Bookkeeping store for one chain.
#[derive(Debug)]
pub struct CacheStore {
    pool: PgPool,
    chain_id: u64,
}

impl CacheStore {
    /// Create a store handle.
    #[must_use]
    pub const fn new(pool: PgPool, chain_id: u64) -> Self {
        Self { pool, chain_id }
    }

    fn chain_id_db(&self) -> i64 {
        i64::try_from(self.chain_id).unwrap_or(i64::MAX)
    }

    /// Read an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT value FROM caches WHERE chain_id = $1 AND name = $2")
            .bind(self.chain_id_db())
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(InfraError::Database)?;
        Ok(row.map(|r| r.get::<serde_json::Value, _>("value")))
    }

    /// Upsert an entry inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn set(
        &self,
        conn: &mut PgConnection,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO caches (chain_id, name, value, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (chain_id, name)
             DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(self.chain_id_db())
        .bind(name)
        .bind(value)
        .execute(conn)
        .await
        .map_err(InfraError::Database)?;
        Ok(())
    }

    /// Read a block-number entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_block(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.get(name).await?.and_then(|v| v.as_u64()))
    }

    /// Write a block-number entry inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn set_block(&self, conn: &mut PgConnection, name: &str, block: u64) -> Result<()> {
        self.set(conn, name, &serde_json::json!(block)).await
    }
}
