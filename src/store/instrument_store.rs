//! Instrument registry.
//!
//! One row per discovered Instrument market. The ingestor loads these at
//! startup to seed fetcher and subscriber subscriptions; the storage
//! processor's `NewInstrument` handler writes new rows.

use std::str::FromStr;

use alloy::primitives::Address;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;
use tracing::warn;

use crate::error::{InfraError, Result};

/// A registered instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentRecord {
    /// Market contract address.
    pub address: Address,
    /// Market symbol from the `NewInstrument` event.
    pub symbol: String,
    /// Block the market was created at.
    pub created_block: u64,
}

/// Instrument persistence for one chain.
#[derive(Debug)]
pub struct InstrumentStore {
    pool: PgPool,
    chain_id: u64,
}

impl InstrumentStore {
    /// Create a store handle.
    #[must_use]
    pub const fn new(pool: PgPool, chain_id: u64) -> Self {
        Self { pool, chain_id }
    }

    fn chain_id_db(&self) -> i64 {
        i64::try_from(self.chain_id).unwrap_or(i64::MAX)
    }

    /// Upsert an instrument row inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn save(
        &self,
        conn: &mut PgConnection,
        record: &InstrumentRecord,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO instruments (chain_id, address, symbol, created_block)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, address) DO NOTHING",
        )
        .bind(self.chain_id_db())
        .bind(format!("{:#x}", record.address))
        .bind(&record.symbol)
        .bind(i64::try_from(record.created_block).unwrap_or(i64::MAX))
        .execute(conn)
        .await
        .map_err(InfraError::Database)?;
        Ok(())
    }

    /// Every registered instrument, in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn all(&self) -> Result<Vec<InstrumentRecord>> {
        let rows = sqlx::query(
            "SELECT address, symbol, created_block FROM instruments
             WHERE chain_id = $1 ORDER BY created_block, address",
        )
        .bind(self.chain_id_db())
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.get("address");
            match Address::from_str(&text) {
                #[allow(clippy::cast_sign_loss)]
                Ok(address) => out.push(InstrumentRecord {
                    address,
                    symbol: row.get("symbol"),
                    created_block: row.get::<i64, _>("created_block") as u64,
                }),
                Err(e) => warn!(address = %text, error = %e, "Skipping bad instrument row"),
            }
        }
        Ok(out)
    }
}
