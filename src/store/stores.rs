//! Composite store implementing the pipeline's port traits.
//!
//! [`Stores`] bundles the per-chain event, snapshot, cache, and instrument
//! stores over one connection pool and provides the transactional port
//! implementations the components depend on.

use alloy::primitives::B256;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::instrument;

use crate::error::{InfraError, Result};
use crate::ports::{EventWriter, ReconcileStore, SnapshotBackend, WriteBatch};
use crate::types::{LogPosition, StoredEvent};

use super::cache_store::{CacheStore, names};
use super::event_store::{DEFAULT_SCAN_LIMIT, EventFilter, EventStore};
use super::instrument_store::{InstrumentRecord, InstrumentStore};
use super::snapshot_store::SnapshotStore;

// ═══════════════════════════════════════════════════════════════════════════════
// STORES
// ═══════════════════════════════════════════════════════════════════════════════

/// All persistence for one chain.
#[derive(Debug)]
pub struct Stores {
    pool: PgPool,
    /// Partitioned event table.
    pub events: EventStore,
    /// Snapshot rows.
    pub snapshots: SnapshotStore,
    /// Bookkeeping blobs.
    pub caches: CacheStore,
    /// Instrument registry.
    pub instruments: InstrumentStore,
}

impl Stores {
    /// Bundle the per-chain stores over `pool`.
    #[must_use]
    pub fn new(pool: PgPool, chain_id: u64) -> Self {
        Self {
            events: EventStore::new(pool.clone(), chain_id),
            snapshots: SnapshotStore::new(pool.clone(), chain_id),
            caches: CacheStore::new(pool.clone(), chain_id),
            instruments: InstrumentStore::new(pool.clone(), chain_id),
            pool,
        }
    }

    /// Initialize the event store (index load + table runway).
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn init(&self) -> Result<()> {
        self.events.init().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT WRITER
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl EventWriter for Stores {
    async fn find_by_id(&self, id: B256, block_number: u64) -> Result<Option<StoredEvent>> {
        self.events
            .find_one(&EventFilter::by_id(id), block_number)
            .await
    }

    #[instrument(skip(self, batch), fields(
        creates = batch.creates.len(),
        promoted = batch.set_processed.len(),
        instruments = batch.instruments.len(),
    ))]
    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut index = self.events.index_snapshot();
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;

        for event in &batch.creates {
            self.events.create(&mut *tx, &mut index, event).await?;
        }
        for event in &batch.set_processed {
            self.events.set_processed(&mut *tx, event).await?;
        }
        for (address, symbol, created_block) in &batch.instruments {
            self.instruments
                .save(
                    &mut *tx,
                    &InstrumentRecord {
                        address: *address,
                        symbol: symbol.clone(),
                        created_block: *created_block,
                    },
                )
                .await?;
        }
        if let Some(latest) = batch.latest_block {
            self.caches
                .set_block(&mut *tx, names::STORED_BLOCK, latest)
                .await?;
        }

        tx.commit().await.map_err(InfraError::Database)?;
        self.events.commit_index(index);
        Ok(())
    }

    async fn stored_block(&self) -> Result<Option<u64>> {
        self.caches.get_block(names::STORED_BLOCK).await
    }

    async fn stored_after(
        &self,
        after: Option<LogPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        self.events
            .next_ordered(after, None, &EventFilter::default(), limit)
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl SnapshotBackend for Stores {
    async fn next_batch(
        &self,
        after: Option<LogPosition>,
        to: Option<LogPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        self.events
            .next_ordered(after, to, &EventFilter::default(), limit)
            .await
    }

    async fn latest_stored_block(&self) -> Result<Option<u64>> {
        self.events.latest_block().await
    }

    async fn nearest_snapshot(
        &self,
        position: LogPosition,
    ) -> Result<Option<(LogPosition, serde_json::Value)>> {
        self.snapshots.nearest_at_or_before(position).await
    }

    async fn destroy_snapshots_from(&self, block: u64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        let deleted = self.snapshots.destroy_from_block(&mut *tx, block).await?;
        tx.commit().await.map_err(InfraError::Database)?;
        Ok(deleted)
    }

    async fn persist_checkpoint(
        &self,
        position: LogPosition,
        state: serde_json::Value,
        prune_before: u64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        self.snapshots.destroy_outdated(&mut *tx, prune_before).await?;
        self.snapshots.save(&mut *tx, position, &state).await?;
        self.caches
            .set_block(&mut *tx, names::PERSISTED_BLOCK, position.block_number)
            .await?;
        tx.commit().await.map_err(InfraError::Database)?;
        Ok(())
    }

    async fn persisted_block(&self) -> Result<Option<u64>> {
        self.caches.get_block(names::PERSISTED_BLOCK).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONCILE STORE
// ═══════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ReconcileStore for Stores {
    async fn events_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<StoredEvent>> {
        let mut cursor = self.events.find_all(
            EventFilter::default(),
            Some(from_block),
            Some(to_block),
            DEFAULT_SCAN_LIMIT,
        );
        let mut out = Vec::new();
        while let Some(batch) = cursor.next(None).await? {
            out.extend(batch);
        }
        Ok(out)
    }

    async fn save_events(&self, events: Vec<StoredEvent>) -> Result<()> {
        let mut index = self.events.index_snapshot();
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        for event in &events {
            self.events.create(&mut *tx, &mut index, event).await?;
        }
        tx.commit().await.map_err(InfraError::Database)?;
        self.events.commit_index(index);
        Ok(())
    }

    async fn latest_stored_block(&self) -> Result<Option<u64>> {
        self.events.latest_block().await
    }
}
