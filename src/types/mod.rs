//! Domain types shared across the indexer.
//!
//! - [`position`] - stream positions and snapshot identifiers
//! - [`log`] - raw chain logs and their stored representation
//! - [`dec`] - decimal-string serde for 256-bit integers

pub mod dec;
pub mod log;
pub mod position;

pub use log::{ChainLog, EventStatus, StoredEvent};
pub use position::{InvalidSnapshotId, LogPosition, SnapshotId};
