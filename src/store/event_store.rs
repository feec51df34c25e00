//! Horizontally partitioned event table.
//!
//! Stored events live in per-chain sub-tables `events_{chain}_{k}`, each
//! capped at [`SUB_TABLE_CAP`] rows. The `event_index` table tracks every
//! sub-table's upper block boundary and occupancy; an in-memory copy of that
//! index routes reads and writes without touching the database.
//!
//! # Invariants
//!
//! - Sub-tables are ordered by `k`; `block_number_max` is non-decreasing in
//!   `k`.
//! - An event routes to the smallest `k` whose `block_number_max` covers its
//!   block; otherwise to the tail while it has room; otherwise to a fresh
//!   sub-table.
//! - `size(k)` equals the rowcount of sub-table `k`; the sum over `k` equals
//!   the total stored rowcount.
//!
//! Writes (`create` / `destroy_one`) must stay serial per chain - the
//! storage processor is the only writer by design.

use std::fmt::Write as _;
use std::str::FromStr;

use alloy::primitives::{Address, B256, Bytes};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{FromRow, Row};
use tracing::{debug, info, instrument};

use crate::error::{InfraError, Result};
use crate::types::{ChainLog, EventStatus, LogPosition, StoredEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum rows per sub-table before a new one is allocated.
pub const SUB_TABLE_CAP: u64 = 1_000_000;

/// Sub-tables pre-created past the last index row, so steady-state inserts
/// never run DDL.
const TABLE_RUNWAY: i32 = 30;

/// Default page size for streaming scans.
pub const DEFAULT_SCAN_LIMIT: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// SUB-TABLE INDEX
// ═══════════════════════════════════════════════════════════════════════════════

/// One `event_index` row: the boundary metadata of sub-table `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubTable {
    /// Sub-table ordinal.
    pub k: i32,
    /// Maximum block number of any event in the sub-table.
    pub block_number_max: u64,
    /// Current rowcount.
    pub size: u64,
}

/// Where an event routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// An existing sub-table.
    Existing(i32),
    /// A fresh sub-table with this ordinal.
    New(i32),
}

/// Pick the sub-table for an event at `block_number`.
///
/// Smallest `k` whose boundary covers the block wins; the tail takes
/// overflow while it has room; a full tail splits.
fn locate_target(index: &[SubTable], block_number: u64) -> Target {
    let Some(tail) = index.last() else {
        return Target::New(0);
    };

    for sub in index {
        if sub.block_number_max >= block_number {
            if sub.k == tail.k && sub.size >= SUB_TABLE_CAP {
                return Target::New(tail.k + 1);
            }
            return Target::Existing(sub.k);
        }
    }

    if tail.size >= SUB_TABLE_CAP {
        Target::New(tail.k + 1)
    } else {
        Target::Existing(tail.k)
    }
}

/// Sub-tables whose block range may contain `block_number`
/// (`prev_max ≤ block ≤ max`, boundary blocks may straddle a split).
fn candidate_tables(index: &[SubTable], block_number: u64) -> Vec<i32> {
    let mut out = Vec::new();
    let mut prev_max = 0u64;
    for (i, sub) in index.iter().enumerate() {
        let lower_ok = i == 0 || prev_max <= block_number;
        if lower_ok && block_number <= sub.block_number_max {
            out.push(sub.k);
        }
        prev_max = sub.block_number_max;
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// FILTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Row filter for lookups and scans. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Match the synthetic id.
    pub id: Option<B256>,
    /// Match the emitting address.
    pub address: Option<Address>,
    /// Match any of these event names.
    pub names: Option<Vec<String>>,
}

impl EventFilter {
    /// Filter by synthetic id.
    #[must_use]
    pub fn by_id(id: B256) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    fn id_text(&self) -> Option<String> {
        self.id.map(|id| format!("{id:#x}"))
    }

    fn address_text(&self) -> Option<String> {
        self.address.map(|a| format!("{a:#x}"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROW MAPPING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    address: String,
    block_number: i64,
    block_hash: String,
    tx_hash: String,
    transaction_index: i64,
    log_index: i64,
    topics: serde_json::Value,
    data: String,
    name: String,
    payload: serde_json::Value,
    block_timestamp: Option<i64>,
    status: i32,
}

#[allow(clippy::cast_sign_loss)] // Block/log ordinals are non-negative in the DB
impl EventRow {
    fn into_stored(self, chain_id: u64) -> std::result::Result<StoredEvent, InfraError> {
        let parse_b256 = |s: &str, what: &str| {
            B256::from_str(s)
                .map_err(|e| InfraError::Internal(format!("bad {what} in DB: {e}")))
        };
        let topics: Vec<B256> = serde_json::from_value(self.topics)?;
        Ok(StoredEvent {
            log: ChainLog {
                chain_id,
                address: Address::from_str(&self.address)
                    .map_err(|e| InfraError::Internal(format!("bad address in DB: {e}")))?,
                block_number: self.block_number as u64,
                block_hash: parse_b256(&self.block_hash, "block_hash")?,
                tx_hash: parse_b256(&self.tx_hash, "tx_hash")?,
                transaction_index: self.transaction_index as u64,
                log_index: self.log_index as u64,
                topics,
                data: Bytes::from_str(&self.data)
                    .map_err(|e| InfraError::Internal(format!("bad data in DB: {e}")))?,
                removed: false,
            },
            name: self.name,
            payload: self.payload,
            timestamp: self.block_timestamp,
            status: EventStatus(self.status),
        })
    }
}

const EVENT_COLUMNS: &str = "id, address, block_number, block_hash, tx_hash, transaction_index, \
                             log_index, topics, data, name, payload, block_timestamp, status";

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Partitioned event store for one chain.
#[derive(Debug)]
pub struct EventStore {
    pool: PgPool,
    chain_id: u64,
    index: parking_lot::RwLock<Vec<SubTable>>,
}

impl EventStore {
    /// Create a store handle; call [`Self::init`] before use.
    #[must_use]
    pub fn new(pool: PgPool, chain_id: u64) -> Self {
        Self {
            pool,
            chain_id,
            index: parking_lot::RwLock::new(Vec::new()),
        }
    }

    fn table(&self, k: i32) -> String {
        format!("events_{}_{}", self.chain_id, k)
    }

    /// Load the sub-table index and pre-create a runway of tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    #[instrument(skip(self), fields(chain = self.chain_id))]
    pub async fn init(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT k, block_number_max, size FROM event_index WHERE chain_id = $1 ORDER BY k",
        )
        .bind(i64::try_from(self.chain_id).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        #[allow(clippy::cast_sign_loss)]
        let index: Vec<SubTable> = rows
            .iter()
            .map(|row| SubTable {
                k: row.get::<i32, _>("k"),
                block_number_max: row.get::<i64, _>("block_number_max") as u64,
                size: row.get::<i64, _>("size") as u64,
            })
            .collect();

        let last = index.last().map_or(0, |s| s.k);
        let mut conn = self.pool.acquire().await.map_err(InfraError::Database)?;
        for k in 0..=(last + TABLE_RUNWAY) {
            self.ensure_table(&mut *conn, k).await?;
        }
        drop(conn);

        info!(
            sub_tables = index.len(),
            runway = TABLE_RUNWAY,
            "Event store initialized"
        );
        *self.index.write() = index;
        Ok(())
    }

    async fn ensure_table(&self, conn: &mut PgConnection, k: i32) -> Result<()> {
        let table = self.table(k);
        let mut ddl = String::new();
        let _ = write!(
            ddl,
            "CREATE TABLE IF NOT EXISTS {table} (
                id                TEXT NOT NULL,
                address           TEXT NOT NULL,
                block_number      BIGINT NOT NULL,
                block_hash        TEXT NOT NULL,
                tx_hash           TEXT NOT NULL,
                transaction_index BIGINT NOT NULL,
                log_index         BIGINT NOT NULL,
                topics            JSONB NOT NULL,
                data              TEXT NOT NULL,
                name              TEXT NOT NULL,
                payload           JSONB NOT NULL,
                block_timestamp   BIGINT,
                status            INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (block_number, transaction_index, log_index)
            )"
        );
        sqlx::query(&ddl)
            .execute(&mut *conn)
            .await
            .map_err(InfraError::Database)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_id_idx ON {table} (id)"
        ))
        .execute(&mut *conn)
        .await
        .map_err(InfraError::Database)?;
        Ok(())
    }

    /// A working copy of the sub-table index for a write transaction.
    #[must_use]
    pub fn index_snapshot(&self) -> Vec<SubTable> {
        self.index.read().clone()
    }

    /// Publish the index after the owning transaction commits.
    pub fn commit_index(&self, index: Vec<SubTable>) {
        *self.index.write() = index;
    }

    /// Insert one event inside the caller's transaction, updating `index`
    /// (the caller's working copy) alongside the `event_index` rows.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the caller rolls back and the
    /// working index copy is discarded with the transaction.
    pub async fn create(
        &self,
        conn: &mut PgConnection,
        index: &mut Vec<SubTable>,
        event: &StoredEvent,
    ) -> Result<()> {
        let block_number = event.log.block_number;
        let k = match locate_target(index, block_number) {
            Target::Existing(k) => k,
            Target::New(k) => {
                self.ensure_table(&mut *conn, k).await?;
                sqlx::query(
                    "INSERT INTO event_index (chain_id, k, block_number_max, size)
                     VALUES ($1, $2, 0, 0) ON CONFLICT DO NOTHING",
                )
                .bind(self.chain_id_db())
                .bind(k)
                .execute(&mut *conn)
                .await
                .map_err(InfraError::Database)?;
                index.push(SubTable {
                    k,
                    block_number_max: 0,
                    size: 0,
                });
                debug!(k, "Allocated event sub-table");
                k
            }
        };

        let table = self.table(k);
        let log = &event.log;
        sqlx::query(&format!(
            "INSERT INTO {table} ({EVENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(format!("{:#x}", event.id()))
        .bind(format!("{:#x}", log.address))
        .bind(i64::try_from(log.block_number).unwrap_or(i64::MAX))
        .bind(format!("{:#x}", log.block_hash))
        .bind(format!("{:#x}", log.tx_hash))
        .bind(i64::try_from(log.transaction_index).unwrap_or(i64::MAX))
        .bind(i64::try_from(log.log_index).unwrap_or(i64::MAX))
        .bind(serde_json::to_value(&log.topics).map_err(InfraError::Serialization)?)
        .bind(log.data.to_string())
        .bind(&event.name)
        .bind(&event.payload)
        .bind(event.timestamp)
        .bind(event.status.0)
        .execute(&mut *conn)
        .await
        .map_err(InfraError::Database)?;

        sqlx::query(
            "UPDATE event_index
             SET block_number_max = GREATEST(block_number_max, $3), size = size + 1
             WHERE chain_id = $1 AND k = $2",
        )
        .bind(self.chain_id_db())
        .bind(k)
        .bind(i64::try_from(block_number).unwrap_or(i64::MAX))
        .execute(&mut *conn)
        .await
        .map_err(InfraError::Database)?;

        if let Some(sub) = index.iter_mut().find(|s| s.k == k) {
            sub.block_number_max = sub.block_number_max.max(block_number);
            sub.size += 1;
        }
        Ok(())
    }

    /// Set the `PROCESSED` bit on an existing event, inside the caller's
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn set_processed(
        &self,
        conn: &mut PgConnection,
        event: &StoredEvent,
    ) -> Result<()> {
        let position = event.position();
        for k in candidate_tables(&self.index_snapshot(), position.block_number) {
            let table = self.table(k);
            let updated = sqlx::query(&format!(
                "UPDATE {table} SET status = status | $1
                 WHERE block_number = $2 AND transaction_index = $3 AND log_index = $4"
            ))
            .bind(EventStatus::PROCESSED)
            .bind(i64::try_from(position.block_number).unwrap_or(i64::MAX))
            .bind(i64::try_from(position.transaction_index).unwrap_or(i64::MAX))
            .bind(i64::try_from(position.log_index).unwrap_or(i64::MAX))
            .execute(&mut *conn)
            .await
            .map_err(InfraError::Database)?;
            if updated.rows_affected() > 0 {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Find the first event matching `filter`, probing only sub-tables whose
    /// block range may contain `block_number`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_one(
        &self,
        filter: &EventFilter,
        block_number: u64,
    ) -> Result<Option<StoredEvent>> {
        for k in candidate_tables(&self.index_snapshot(), block_number) {
            let table = self.table(k);
            let row = sqlx::query_as::<_, EventRow>(&format!(
                "SELECT {EVENT_COLUMNS} FROM {table}
                 WHERE block_number = $1
                   AND ($2::text IS NULL OR id = $2)
                   AND ($3::text IS NULL OR address = $3)
                   AND ($4::text[] IS NULL OR name = ANY($4))
                 LIMIT 1"
            ))
            .bind(i64::try_from(block_number).unwrap_or(i64::MAX))
            .bind(filter.id_text())
            .bind(filter.address_text())
            .bind(filter.names.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(InfraError::Database)?;

            if let Some(row) = row {
                return Ok(Some(row.into_stored(self.chain_id)?));
            }
        }
        Ok(None)
    }

    /// Start a lazily paginated scan of `[from, to]` (block bounds,
    /// inclusive). The cursor accepts a refined filter before each batch.
    #[must_use]
    pub fn find_all(
        &self,
        filter: EventFilter,
        from: Option<u64>,
        to: Option<u64>,
        limit: usize,
    ) -> EventCursor<'_> {
        let tables = self
            .index_snapshot()
            .iter()
            .filter(|sub| {
                // Sub-tables strictly below `from` cannot overlap the range.
                from.is_none_or(|f| sub.block_number_max >= f)
            })
            .map(|sub| sub.k)
            .collect();
        EventCursor {
            store: self,
            filter,
            from,
            to,
            tables,
            table_pos: 0,
            offset: 0,
            limit: limit.max(1),
        }
    }

    /// Next ordered batch of events with position strictly greater than
    /// `after` (`None` = from the beginning) and at most `to` (inclusive),
    /// across sub-tables, capped at `limit`. Callers re-anchor on the last
    /// yielded position.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next_ordered(
        &self,
        after: Option<LogPosition>,
        to: Option<LogPosition>,
        filter: &EventFilter,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        let limit = limit.max(1);
        let mut out: Vec<StoredEvent> = Vec::new();
        let upper = to.unwrap_or(LogPosition::block_end(u64::MAX));
        // A strict lower bound below every valid position stands in for "no
        // anchor"; ordinals are non-negative in the DB.
        let anchor = after.map_or((-1i64, -1i64, -1i64), |p| {
            (
                i64::try_from(p.block_number).unwrap_or(i64::MAX),
                i64::try_from(p.transaction_index).unwrap_or(i64::MAX),
                i64::try_from(p.log_index).unwrap_or(i64::MAX),
            )
        });

        for sub in self.index_snapshot() {
            if out.len() >= limit {
                break;
            }
            // Skip sub-tables entirely below the anchor.
            if after.is_some_and(|a| sub.block_number_max < a.block_number) {
                continue;
            }
            let table = self.table(sub.k);
            let remaining = limit - out.len();
            let rows = sqlx::query_as::<_, EventRow>(&format!(
                "SELECT {EVENT_COLUMNS} FROM {table}
                 WHERE (block_number, transaction_index, log_index) > ($1, $2, $3)
                   AND (block_number, transaction_index, log_index) <= ($4, $5, $6)
                   AND ($7::text IS NULL OR address = $7)
                   AND ($8::text[] IS NULL OR name = ANY($8))
                 ORDER BY block_number, transaction_index, log_index
                 LIMIT $9"
            ))
            .bind(anchor.0)
            .bind(anchor.1)
            .bind(anchor.2)
            .bind(i64::try_from(upper.block_number).unwrap_or(i64::MAX))
            .bind(i64::try_from(upper.transaction_index).unwrap_or(i64::MAX))
            .bind(i64::try_from(upper.log_index).unwrap_or(i64::MAX))
            .bind(filter.address_text())
            .bind(filter.names.clone())
            .bind(i64::try_from(remaining).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(InfraError::Database)?;

            for row in rows {
                out.push(row.into_stored(self.chain_id)?);
            }
        }
        Ok(out)
    }

    /// Delete events matching `filter` at `block_number`; decrements the
    /// owning sub-table's size under one transaction. Returns rows deleted.
    ///
    /// Must be called serially per chain, like [`Self::create`].
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn destroy_one(&self, filter: &EventFilter, block_number: u64) -> Result<u64> {
        let mut index = self.index_snapshot();
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        let mut deleted = 0u64;

        for k in candidate_tables(&index, block_number) {
            let table = self.table(k);
            let result = sqlx::query(&format!(
                "DELETE FROM {table}
                 WHERE block_number = $1
                   AND ($2::text IS NULL OR id = $2)
                   AND ($3::text IS NULL OR address = $3)
                   AND ($4::text[] IS NULL OR name = ANY($4))"
            ))
            .bind(i64::try_from(block_number).unwrap_or(i64::MAX))
            .bind(filter.id_text())
            .bind(filter.address_text())
            .bind(filter.names.clone())
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;

            let count = result.rows_affected();
            if count > 0 {
                sqlx::query(
                    "UPDATE event_index SET size = size - $3
                     WHERE chain_id = $1 AND k = $2",
                )
                .bind(self.chain_id_db())
                .bind(k)
                .bind(i64::try_from(count).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await
                .map_err(InfraError::Database)?;
                if let Some(sub) = index.iter_mut().find(|s| s.k == k) {
                    sub.size = sub.size.saturating_sub(count);
                }
                deleted += count;
                break;
            }
        }

        tx.commit().await.map_err(InfraError::Database)?;
        self.commit_index(index);
        Ok(deleted)
    }

    /// Highest block number with at least one stored event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn latest_block(&self) -> Result<Option<u64>> {
        let index = self.index_snapshot();
        for sub in index.iter().rev() {
            if sub.size == 0 {
                continue;
            }
            let table = self.table(sub.k);
            let max: Option<i64> =
                sqlx::query_scalar(&format!("SELECT MAX(block_number) FROM {table}"))
                    .fetch_one(&self.pool)
                    .await
                    .map_err(InfraError::Database)?;
            if let Some(max) = max {
                #[allow(clippy::cast_sign_loss)]
                return Ok(Some(max as u64));
            }
        }
        Ok(None)
    }

    fn chain_id_db(&self) -> i64 {
        i64::try_from(self.chain_id).unwrap_or(i64::MAX)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CURSOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Lazily paginated scan over sub-tables overlapping a block range.
///
/// The consumer may refine the filter before each batch (continuation-cursor
/// semantics). Within a sub-table, pagination advances by `limit`-sized
/// offsets while full pages return.
#[derive(Debug)]
pub struct EventCursor<'a> {
    store: &'a EventStore,
    filter: EventFilter,
    from: Option<u64>,
    to: Option<u64>,
    tables: Vec<i32>,
    table_pos: usize,
    offset: i64,
    limit: usize,
}

impl EventCursor<'_> {
    /// Fetch the next batch, optionally replacing the filter first.
    ///
    /// Returns `None` once every overlapping sub-table is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next(&mut self, refine: Option<EventFilter>) -> Result<Option<Vec<StoredEvent>>> {
        if let Some(refined) = refine {
            self.filter = refined;
        }

        while let Some(&k) = self.tables.get(self.table_pos) {
            let table = self.store.table(k);
            let rows = sqlx::query_as::<_, EventRow>(&format!(
                "SELECT {EVENT_COLUMNS} FROM {table}
                 WHERE ($1::bigint IS NULL OR block_number >= $1)
                   AND ($2::bigint IS NULL OR block_number <= $2)
                   AND ($3::text IS NULL OR id = $3)
                   AND ($4::text IS NULL OR address = $4)
                   AND ($5::text[] IS NULL OR name = ANY($5))
                 ORDER BY block_number, transaction_index, log_index
                 LIMIT $6 OFFSET $7"
            ))
            .bind(self.from.map(|b| i64::try_from(b).unwrap_or(i64::MAX)))
            .bind(self.to.map(|b| i64::try_from(b).unwrap_or(i64::MAX)))
            .bind(self.filter.id_text())
            .bind(self.filter.address_text())
            .bind(self.filter.names.clone())
            .bind(i64::try_from(self.limit).unwrap_or(i64::MAX))
            .bind(self.offset)
            .fetch_all(&self.store.pool)
            .await
            .map_err(InfraError::Database)?;

            let full_page = rows.len() == self.limit;
            if full_page {
                self.offset += i64::try_from(self.limit).unwrap_or(i64::MAX);
            } else {
                // Short page: this sub-table is exhausted.
                self.table_pos += 1;
                self.offset = 0;
            }

            if rows.is_empty() {
                continue;
            }

            let mut events = Vec::with_capacity(rows.len());
            for row in rows {
                events.push(row.into_stored(self.store.chain_id)?);
            }
            return Ok(Some(events));
        }
        Ok(None)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
