//! In-memory fakes and builders for pipeline tests.
//!
//! [`MemStore`] implements every storage port over one event vector, so a
//! single instance can back the storage processor, the snapshot driver, and
//! the reorg detector at once - the same way the production `Stores` does
//! over one pool.

#![allow(dead_code)] // Not every test file uses every helper

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, Bytes, I256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use parking_lot::Mutex;

use obelisk_indexer::abi::{ProtocolEvent, gate, instrument};
use obelisk_indexer::chain::client::{BlockHeader, ChainRpc};
use obelisk_indexer::error::Result;
use obelisk_indexer::ports::{
    EventWriter, ReconcileStore, SnapshotBackend, WriteBatch,
};
use obelisk_indexer::types::{ChainLog, EventStatus, LogPosition, StoredEvent};

/// Gate address used across tests.
pub const GATE: Address = Address::repeat_byte(0x0A);
/// Config address used across tests.
pub const CONFIG: Address = Address::repeat_byte(0x0B);
/// The instrument address from the API documentation examples.
pub fn doc_instrument() -> Address {
    "0x145d000000000000000000000000000000006644"
        .parse()
        .unwrap()
}
/// Trader used across tests.
pub const TRADER: Address = Address::repeat_byte(0x77);
/// Perpetual expiry.
pub const PERP: u32 = u32::MAX;

// ═══════════════════════════════════════════════════════════════════════════════
// LOG BUILDERS
// ═══════════════════════════════════════════════════════════════════════════════

fn raw_log(address: Address, block: u64, tx: u64, log_index: u64) -> ChainLog {
    ChainLog {
        chain_id: 81457,
        address,
        block_number: block,
        block_hash: B256::with_last_byte(u8::try_from(block % 251).unwrap_or(1)),
        tx_hash: B256::repeat_byte(0x42),
        transaction_index: tx,
        log_index,
        topics: vec![],
        data: Bytes::new(),
        removed: false,
    }
}

fn encode<E: SolEvent>(mut log: ChainLog, event: &E) -> ChainLog {
    log.topics = event.encode_topics().into_iter().map(|t| t.0).collect();
    log.data = event.encode_data().into();
    log
}

/// A Gate `Deposit` log.
pub fn deposit_log(block: u64, log_index: u64) -> ChainLog {
    encode(
        raw_log(GATE, block, 0, log_index),
        &gate::Deposit {
            quote: Address::repeat_byte(0x05),
            trader: TRADER,
            quantity: U256::from(1_000u64),
        },
    )
}

/// A Gate `NewInstrument` log for `market`.
pub fn new_instrument_log(block: u64, market: Address) -> ChainLog {
    encode(
        raw_log(GATE, block, 0, 0),
        &gate::NewInstrument {
            instrument: market,
            index: B256::repeat_byte(0x01),
            symbol: "ETH-USDB-PERP".into(),
        },
    )
}

/// An `UpdateAmmStatus` log putting the pair in Trading at `tick`.
pub fn amm_status_log(market: Address, block: u64, tick: i32) -> ChainLog {
    encode(
        raw_log(market, block, 0, 0),
        &instrument::UpdateAmmStatus {
            expiry: PERP,
            status: 1,
            sqrtPX96: U256::from(1u64) << 96,
            tick,
        },
    )
}

/// A `Trade` log.
pub fn trade_log(market: Address, block: u64, tx: u64, log_index: u64, size: i64) -> ChainLog {
    encode(
        raw_log(market, block, tx, log_index),
        &instrument::Trade {
            trader: TRADER,
            expiry: PERP,
            size: I256::try_from(size).unwrap(),
            amount: U256::from(5_000u64),
            sqrtPX96: U256::from(1u64) << 96,
            tick: 15_777,
            feeRatio: U256::from(30u64),
        },
    )
}

/// The stored form of a raw log (decoded against `kind`'s interface).
pub fn stored(log: &ChainLog, kind: obelisk_indexer::abi::ContractKind) -> StoredEvent {
    let parsed = ProtocolEvent::decode(kind, &log.to_primitive())
        .unwrap()
        .expect("builder logs decode");
    StoredEvent {
        log: log.clone(),
        name: parsed.name().to_string(),
        payload: parsed.to_payload().unwrap(),
        timestamp: None,
        status: EventStatus::default().processed(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEM STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// One in-memory store implementing every storage port.
#[derive(Debug, Default)]
pub struct MemStore {
    /// Stored events, kept position-sorted.
    pub events: Mutex<Vec<StoredEvent>>,
    /// Stored snapshots by position.
    pub snapshots: Mutex<BTreeMap<LogPosition, serde_json::Value>>,
    /// Registered instruments.
    pub instruments: Mutex<Vec<(Address, String, u64)>>,
    /// Stored-block cursor.
    pub stored_block: Mutex<Option<u64>>,
    /// Persisted-block cursor.
    pub persisted_block: Mutex<Option<u64>>,
}

impl MemStore {
    /// Seed with pre-stored events (sorted on insert).
    pub fn seed(events: Vec<StoredEvent>) -> std::sync::Arc<Self> {
        let store = Self::default();
        {
            let mut guard = store.events.lock();
            *guard = events;
            guard.sort_by_key(StoredEvent::position);
        }
        std::sync::Arc::new(store)
    }
}

#[async_trait]
impl EventWriter for MemStore {
    async fn find_by_id(&self, id: B256, _block: u64) -> Result<Option<StoredEvent>> {
        Ok(self.events.lock().iter().find(|e| e.id() == id).cloned())
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut events = self.events.lock();
        events.extend(batch.creates);
        for promoted in batch.set_processed {
            if let Some(found) = events.iter_mut().find(|e| e.id() == promoted.id()) {
                found.status = found.status.processed();
            }
        }
        events.sort_by_key(StoredEvent::position);
        self.instruments.lock().extend(batch.instruments);
        if let Some(latest) = batch.latest_block {
            *self.stored_block.lock() = Some(latest);
        }
        Ok(())
    }

    async fn stored_block(&self) -> Result<Option<u64>> {
        Ok(*self.stored_block.lock())
    }

    async fn stored_after(
        &self,
        after: Option<LogPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| after.is_none_or(|a| e.position() > a))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotBackend for MemStore {
    async fn next_batch(
        &self,
        after: Option<LogPosition>,
        to: Option<LogPosition>,
        limit: usize,
    ) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| after.is_none_or(|a| e.position() > a))
            .filter(|e| to.is_none_or(|t| e.position() <= t))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_stored_block(&self) -> Result<Option<u64>> {
        Ok(self.events.lock().iter().map(|e| e.log.block_number).max())
    }

    async fn nearest_snapshot(
        &self,
        position: LogPosition,
    ) -> Result<Option<(LogPosition, serde_json::Value)>> {
        Ok(self
            .snapshots
            .lock()
            .range(..=position)
            .next_back()
            .map(|(p, v)| (*p, v.clone())))
    }

    async fn destroy_snapshots_from(&self, block: u64) -> Result<u64> {
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|p, _| p.block_number < block);
        Ok((before - snapshots.len()) as u64)
    }

    async fn persist_checkpoint(
        &self,
        position: LogPosition,
        state: serde_json::Value,
        prune_before: u64,
    ) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        if let Some(newest) = snapshots.keys().next_back().copied() {
            snapshots.retain(|p, _| p.block_number > prune_before || *p == newest);
        }
        snapshots.entry(position).or_insert(state);
        *self.persisted_block.lock() = Some(position.block_number);
        Ok(())
    }

    async fn persisted_block(&self) -> Result<Option<u64>> {
        Ok(*self.persisted_block.lock())
    }
}

#[async_trait]
impl ReconcileStore for MemStore {
    async fn events_in_range(&self, from_block: u64, to_block: u64) -> Result<Vec<StoredEvent>> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.log.block_number >= from_block && e.log.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn save_events(&self, new_events: Vec<StoredEvent>) -> Result<()> {
        let mut events = self.events.lock();
        events.extend(new_events);
        events.sort_by_key(StoredEvent::position);
        Ok(())
    }

    async fn latest_stored_block(&self) -> Result<Option<u64>> {
        Ok(self.events.lock().iter().map(|e| e.log.block_number).max())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPTED RPC
// ═══════════════════════════════════════════════════════════════════════════════

/// A chain whose logs and head are test-controlled.
#[derive(Debug, Default)]
pub struct ScriptedChain {
    /// Logs the node reports.
    pub logs: Mutex<Vec<ChainLog>>,
    /// Current head.
    pub head: Mutex<u64>,
}

#[async_trait]
impl ChainRpc for ScriptedChain {
    fn chain_id(&self) -> u64 {
        81457
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: Address,
        _topics: &[B256],
    ) -> Result<Vec<ChainLog>> {
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|l| {
                l.address == address
                    && l.block_number >= from_block
                    && l.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>> {
        Ok(Some(BlockHeader {
            number,
            hash: B256::with_last_byte(u8::try_from(number % 251).unwrap_or(1)),
            parent_hash: B256::ZERO,
            timestamp: 1_700_000_000 + number,
        }))
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(*self.head.lock())
    }
}
