//! Snapshot engine: deterministic state plus the live-snapshot driver.
//!
//! - [`state`] - the replayable application state
//! - [`driver`] - live snapshot maintenance, persistence, reorg recovery

pub mod driver;
pub mod state;

pub use driver::{SnapshotDriver, SnapshotStatus, generate};
pub use state::{AccountState, InstrumentState, OrderState, PairState, RangeState, Snapshot};
