//! Data persistence (PostgreSQL via SQLx).
//!
//! - [`event_store`] - partitioned `events_{chain}_{k}` sub-tables
//! - [`snapshot_store`] - snapshot rows keyed by stream position
//! - [`cache_store`] - `(chain_id, name) → JSON` bookkeeping
//! - [`instrument_store`] - discovered instrument registry
//! - [`stores`] - composite [`Stores`] implementing the port traits

pub mod cache_store;
pub mod event_store;
pub mod instrument_store;
pub mod snapshot_store;
pub mod stores;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseSettings;
use crate::error::{InfraError, Result};

pub use cache_store::CacheStore;
pub use event_store::{EventCursor, EventFilter, EventStore, SUB_TABLE_CAP};
pub use instrument_store::{InstrumentRecord, InstrumentStore};
pub use snapshot_store::SnapshotStore;
pub use stores::Stores;

/// Open the connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the database is unreachable or a migration fails.
pub async fn connect(settings: &DatabaseSettings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.connect_timeout())
        .connect(&settings.url)
        .await
        .map_err(InfraError::Database)?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| InfraError::Internal(format!("migration error: {e}")))?;

    Ok(pool)
}
