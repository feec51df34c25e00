//! Log-stream positions and snapshot identifiers.
//!
//! Every point in the event stream is named by a [`LogPosition`] - the triple
//! `(block_number, transaction_index, log_index)`, totally ordered
//! lexicographically. Snapshots generated on demand are addressed by a
//! [`SnapshotId`] whose string form is a stable wire contract:
//!
//! ```text
//! "{chainId}-{blockNumber}"                               (block-only form)
//! "{chainId}-{blockNumber}-{txIndex}-{logIndex}"          (triple form)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// LOG POSITION
// ═══════════════════════════════════════════════════════════════════════════════

/// A point in the ordered log stream.
///
/// The derived `Ord` is lexicographic over `(block_number, transaction_index,
/// log_index)`, which is exactly the on-chain emission order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogPosition {
    /// Block number containing the log.
    pub block_number: u64,
    /// Index of the transaction within the block.
    pub transaction_index: u64,
    /// Index of the log within the block.
    pub log_index: u64,
}

impl LogPosition {
    /// Create a position from its three components.
    #[must_use]
    pub const fn new(block_number: u64, transaction_index: u64, log_index: u64) -> Self {
        Self {
            block_number,
            transaction_index,
            log_index,
        }
    }

    /// The greatest position inside `block_number`.
    ///
    /// Useful as an inclusive upper bound when a caller names a block but not
    /// a transaction or log offset.
    #[must_use]
    pub const fn block_end(block_number: u64) -> Self {
        Self {
            block_number,
            transaction_index: u64::MAX,
            log_index: u64::MAX,
        }
    }

    /// The smallest position inside `block_number`.
    #[must_use]
    pub const fn block_start(block_number: u64) -> Self {
        Self {
            block_number,
            transaction_index: 0,
            log_index: 0,
        }
    }

    /// Whether this position names a whole block rather than an exact log.
    #[must_use]
    pub const fn is_block_bound(&self) -> bool {
        self.transaction_index == u64::MAX && self.log_index == u64::MAX
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT ID
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifier of a generated snapshot.
///
/// The string form is part of the public API and must not change shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    /// Chain the snapshot belongs to.
    pub chain_id: u64,
    /// Block number of the snapshot position.
    pub block_number: u64,
    /// Exact `(transaction_index, log_index)` when present; block-only form
    /// otherwise.
    pub exact: Option<(u64, u64)>,
}

impl SnapshotId {
    /// Build an id from a chain and a position.
    ///
    /// A position that is a block bound (see [`LogPosition::is_block_bound`])
    /// formats in the block-only form.
    #[must_use]
    pub const fn from_position(chain_id: u64, position: LogPosition) -> Self {
        Self {
            chain_id,
            block_number: position.block_number,
            exact: if position.is_block_bound() {
                None
            } else {
                Some((position.transaction_index, position.log_index))
            },
        }
    }

    /// The position this id addresses (block-only ids address the block end).
    #[must_use]
    pub const fn position(&self) -> LogPosition {
        match self.exact {
            Some((transaction_index, log_index)) => LogPosition {
                block_number: self.block_number,
                transaction_index,
                log_index,
            },
            None => LogPosition::block_end(self.block_number),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exact {
            Some((tx, log)) => write!(
                f,
                "{}-{}-{}-{}",
                self.chain_id, self.block_number, tx, log
            ),
            None => write!(f, "{}-{}", self.chain_id, self.block_number),
        }
    }
}

/// Error parsing a snapshot id string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snapshot id: {0}")]
pub struct InvalidSnapshotId(pub String);

impl FromStr for SnapshotId {
    type Err = InvalidSnapshotId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        let parse = |p: &str| p.parse::<u64>().map_err(|_| InvalidSnapshotId(s.into()));

        match parts.as_slice() {
            [chain, block] => Ok(Self {
                chain_id: parse(chain)?,
                block_number: parse(block)?,
                exact: None,
            }),
            [chain, block, tx, log] => Ok(Self {
                chain_id: parse(chain)?,
                block_number: parse(block)?,
                exact: Some((parse(tx)?, parse(log)?)),
            }),
            _ => Err(InvalidSnapshotId(s.into())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
