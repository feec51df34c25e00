//! Raw chain logs and their stored representation.
//!
//! A [`ChainLog`] is the provider-independent form of an EVM log, tagged with
//! the chain it came from. Its synthetic [`ChainLog::id`] is stable across
//! the fetched, subscribed, and stored representations of the same log, and
//! is what deduplication and reorg reconciliation key on.

use alloy::primitives::{Address, B256, Bytes, keccak256};
use serde::{Deserialize, Serialize};

use super::position::LogPosition;

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN LOG
// ═══════════════════════════════════════════════════════════════════════════════

/// An EVM log with full positional metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLog {
    /// Chain the log was emitted on.
    pub chain_id: u64,
    /// Contract that emitted the log.
    pub address: Address,
    /// Block number containing the log.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
    /// Transaction that emitted the log.
    pub tx_hash: B256,
    /// Index of the transaction within the block.
    pub transaction_index: u64,
    /// Index of the log within the block.
    pub log_index: u64,
    /// Event topics (topic0 is the signature hash).
    pub topics: Vec<B256>,
    /// ABI-encoded event data.
    pub data: Bytes,
    /// Set on subscription notifications when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl ChainLog {
    /// Synthetic 256-bit identifier, stable across representations.
    ///
    /// `keccak256(chain_id_be ‖ address ‖ block_hash ‖ tx_hash ‖ log_index_be)`.
    #[must_use]
    pub fn id(&self) -> B256 {
        let mut buf = Vec::with_capacity(8 + 20 + 32 + 32 + 8);
        buf.extend_from_slice(&self.chain_id.to_be_bytes());
        buf.extend_from_slice(self.address.as_slice());
        buf.extend_from_slice(self.block_hash.as_slice());
        buf.extend_from_slice(self.tx_hash.as_slice());
        buf.extend_from_slice(&self.log_index.to_be_bytes());
        keccak256(&buf)
    }

    /// The log's position in the stream.
    #[must_use]
    pub const fn position(&self) -> LogPosition {
        LogPosition::new(self.block_number, self.transaction_index, self.log_index)
    }

    /// Convert an RPC log, failing if positional metadata is missing
    /// (pending logs have no block assignment and cannot be indexed).
    ///
    /// # Errors
    ///
    /// Returns the name of the first missing field.
    pub fn from_rpc(chain_id: u64, log: &alloy::rpc::types::Log) -> Result<Self, &'static str> {
        Ok(Self {
            chain_id,
            address: log.address(),
            block_number: log.block_number.ok_or("blockNumber")?,
            block_hash: log.block_hash.ok_or("blockHash")?,
            tx_hash: log.transaction_hash.ok_or("transactionHash")?,
            transaction_index: log.transaction_index.ok_or("transactionIndex")?,
            log_index: log.log_index.ok_or("logIndex")?,
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            removed: log.removed,
        })
    }

    /// The log as an [`alloy::primitives::Log`] for ABI decoding.
    #[must_use]
    pub fn to_primitive(&self) -> alloy::primitives::Log {
        alloy::primitives::Log::new_unchecked(
            self.address,
            self.topics.clone(),
            self.data.clone(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORED EVENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Processing-status bitmask of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventStatus(pub i32);

impl EventStatus {
    /// Bit set once the event has been dispatched through its handler.
    pub const PROCESSED: i32 = 1;

    /// Whether the `PROCESSED` bit is set.
    #[must_use]
    pub const fn is_processed(self) -> bool {
        self.0 & Self::PROCESSED != 0
    }

    /// The status with the `PROCESSED` bit set.
    #[must_use]
    pub const fn processed(self) -> Self {
        Self(self.0 | Self::PROCESSED)
    }
}

/// A log as persisted in an `events_{chain}_{k}` sub-table: the raw log plus
/// its decoded name, the serialized payload, and bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// The underlying raw log.
    pub log: ChainLog,
    /// Decoded event name (e.g. `"Trade"`).
    pub name: String,
    /// Serialized decoded arguments.
    pub payload: serde_json::Value,
    /// Block timestamp, filled in lazily (reorg reconciliation back-fills it).
    pub timestamp: Option<i64>,
    /// Processing-status bitmask.
    pub status: EventStatus,
}

impl StoredEvent {
    /// The event's position in the stream.
    #[must_use]
    pub const fn position(&self) -> LogPosition {
        self.log.position()
    }

    /// Synthetic identifier (see [`ChainLog::id`]).
    #[must_use]
    pub fn id(&self) -> B256 {
        self.log.id()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
