//! Port traits decoupling pipeline components from infrastructure.
//!
//! Components depend on these seams; `store/` and `mq/` provide the
//! production implementations, tests provide in-memory fakes.

pub mod store;
pub mod streaming;

pub use store::{EventWriter, ReconcileStore, SnapshotBackend, WriteBatch};
pub use streaming::{Notification, NotificationSink};
