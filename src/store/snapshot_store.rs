//! Persisted snapshots keyed by stream position.
//!
//! One row per `(chain_id, position)`; `save` is idempotent (create-if-absent
//! only). Retention is range deletion: reorgs destroy everything at or above
//! the divergence block, the periodic persistence pass prunes outdated rows
//! while always keeping the newest one.

use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;
use tracing::instrument;

use crate::error::{InfraError, Result};
use crate::types::LogPosition;

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot persistence for one chain.
#[derive(Debug)]
pub struct SnapshotStore {
    pool: PgPool,
    chain_id: u64,
}

#[allow(clippy::cast_sign_loss)] // Ordinals are non-negative in the DB
impl SnapshotStore {
    /// Create a store handle.
    #[must_use]
    pub const fn new(pool: PgPool, chain_id: u64) -> Self {
        Self { pool, chain_id }
    }

    fn chain_id_db(&self) -> i64 {
        i64::try_from(self.chain_id).unwrap_or(i64::MAX)
    }

    /// Save a snapshot at `position` unless one already exists there.
    /// Returns whether a row was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    #[instrument(skip(self, state), fields(chain = self.chain_id, %position))]
    pub async fn save(
        &self,
        conn: &mut PgConnection,
        position: LogPosition,
        state: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO snapshots (chain_id, block_number, transaction_index, log_index, state)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT DO NOTHING",
        )
        .bind(self.chain_id_db())
        .bind(i64::try_from(position.block_number).unwrap_or(i64::MAX))
        .bind(i64::try_from(position.transaction_index).unwrap_or(i64::MAX))
        .bind(i64::try_from(position.log_index).unwrap_or(i64::MAX))
        .bind(state)
        .execute(conn)
        .await
        .map_err(InfraError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete snapshots with `block_number ≥ block`; returns rows deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn destroy_from_block(&self, conn: &mut PgConnection, block: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM snapshots WHERE chain_id = $1 AND block_number >= $2",
        )
        .bind(self.chain_id_db())
        .bind(i64::try_from(block).unwrap_or(i64::MAX))
        .execute(conn)
        .await
        .map_err(InfraError::Database)?;
        Ok(result.rows_affected())
    }

    /// Prune snapshots with `block_number ≤ before`, always keeping the
    /// newest row; returns rows deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn destroy_outdated(&self, conn: &mut PgConnection, before: u64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM snapshots
             WHERE chain_id = $1 AND block_number <= $2
               AND (block_number, transaction_index, log_index) < (
                   SELECT block_number, transaction_index, log_index FROM snapshots
                   WHERE chain_id = $1
                   ORDER BY block_number DESC, transaction_index DESC, log_index DESC
                   LIMIT 1
               )",
        )
        .bind(self.chain_id_db())
        .bind(i64::try_from(before).unwrap_or(i64::MAX))
        .execute(conn)
        .await
        .map_err(InfraError::Database)?;
        Ok(result.rows_affected())
    }

    /// The snapshot with the greatest position ≤ `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn nearest_at_or_before(
        &self,
        position: LogPosition,
    ) -> Result<Option<(LogPosition, serde_json::Value)>> {
        let row = sqlx::query(
            "SELECT block_number, transaction_index, log_index, state FROM snapshots
             WHERE chain_id = $1
               AND (block_number, transaction_index, log_index) <= ($2, $3, $4)
             ORDER BY block_number DESC, transaction_index DESC, log_index DESC
             LIMIT 1",
        )
        .bind(self.chain_id_db())
        .bind(i64::try_from(position.block_number).unwrap_or(i64::MAX))
        .bind(i64::try_from(position.transaction_index).unwrap_or(i64::MAX))
        .bind(i64::try_from(position.log_index).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        Ok(row.map(|row| {
            (
                LogPosition::new(
                    row.get::<i64, _>("block_number") as u64,
                    row.get::<i64, _>("transaction_index") as u64,
                    row.get::<i64, _>("log_index") as u64,
                ),
                row.get::<serde_json::Value, _>("state"),
            )
        }))
    }

    /// Every stored snapshot position, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn positions(&self) -> Result<Vec<LogPosition>> {
        let rows = sqlx::query(
            "SELECT block_number, transaction_index, log_index FROM snapshots
             WHERE chain_id = $1
             ORDER BY block_number, transaction_index, log_index",
        )
        .bind(self.chain_id_db())
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        Ok(rows
            .iter()
            .map(|row| {
                LogPosition::new(
                    row.get::<i64, _>("block_number") as u64,
                    row.get::<i64, _>("transaction_index") as u64,
                    row.get::<i64, _>("log_index") as u64,
                )
            })
            .collect())
    }

    /// Pool accessor for callers composing transactions.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}
