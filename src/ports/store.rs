//! Storage port traits for the ingestion, snapshot, and reorg components.
//!
//! The event table is partitioned and append-mostly; these traits expose the
//! handful of access patterns the pipeline actually needs, each implemented
//! transactionally by the PostgreSQL layer:
//!
//! - [`EventWriter`] - the storage processor's seam: id lookups plus an
//!   atomic batch write
//! - [`SnapshotBackend`] - the snapshot driver's seam: ordered replay reads
//!   and snapshot persistence with retention
//! - [`ReconcileStore`] - the reorg detector's seam: range scans and
//!   back-fill saves

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{LogPosition, StoredEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT WRITER
// ═══════════════════════════════════════════════════════════════════════════════

/// One atomic unit of storage-processor output.
///
/// Everything in a batch commits in a single transaction: event inserts,
/// status promotions, discovered instrument rows, and the stored-block
/// bookkeeping entry.
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Events to insert (with `PROCESSED` already set).
    pub creates: Vec<StoredEvent>,
    /// Existing events whose `PROCESSED` bit must be set.
    pub set_processed: Vec<StoredEvent>,
    /// Newly discovered instruments to register.
    pub instruments: Vec<(Address, String, u64)>,
    /// Highest block across the batch; persisted as the stored-block cursor
    /// when it advances.
    pub latest_block: Option<u64>,
}

impl WriteBatch {
    /// Whether the batch would write anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.set_processed.is_empty()
            && self.instruments.is_empty()
            && self.latest_block.is_none()
    }
}

/// Write seam used by the storage processor (the event table's only writer;
/// calls must stay serial per chain).
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Look an event up by synthetic id, probing only sub-tables whose block
    /// range can contain `block_number`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn find_by_id(&self, id: B256, block_number: u64) -> Result<Option<StoredEvent>>;

    /// Commit a batch atomically; on any failure nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails (the caller retries).
    async fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// The persisted stored-block cursor, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn stored_block(&self) -> Result<Option<u64>>;

    /// Next ordered batch of stored events after `after` (strict), capped at
    /// `limit`. Used by reorg reprocessing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn stored_after(
        &self,
        after: Option<LogPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT BACKEND
// ═══════════════════════════════════════════════════════════════════════════════

/// Read/persist seam used by the snapshot driver and the request handler's
/// replays.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Next ordered batch of stored events with position strictly greater
    /// than `after` (`None` = from the beginning) and at most `to`
    /// (inclusive), capped at `limit`.
    ///
    /// Callers re-anchor on the last yielded position to stream the range.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn next_batch(
        &self,
        after: Option<LogPosition>,
        to: Option<LogPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>>;

    /// Highest block number present in the event table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn latest_stored_block(&self) -> Result<Option<u64>>;

    /// The stored snapshot with the greatest position ≤ `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn nearest_snapshot(
        &self,
        position: LogPosition,
    ) -> Result<Option<(LogPosition, Value)>>;

    /// Delete stored snapshots with `block_number ≥ block`; returns the count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn destroy_snapshots_from(&self, block: u64) -> Result<u64>;

    /// Atomically prune snapshots with `block_number ≤ prune_before` (always
    /// keeping the newest row), save the snapshot at `position` if absent,
    /// and advance the persisted-block cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    async fn persist_checkpoint(
        &self,
        position: LogPosition,
        state: Value,
        prune_before: u64,
    ) -> Result<()>;

    /// The persisted-block cursor, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn persisted_block(&self) -> Result<Option<u64>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONCILE STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Read/back-fill seam used by the reorg detector.
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    /// Every stored event with `from_block ≤ block_number ≤ to_block`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn events_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<StoredEvent>>;

    /// Insert reconciled events in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails (the caller retries).
    async fn save_events(&self, events: Vec<StoredEvent>) -> Result<()>;

    /// Highest block number present in the event table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    async fn latest_stored_block(&self) -> Result<Option<u64>>;
}
