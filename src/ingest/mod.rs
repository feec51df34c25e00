//! Ingestion pipeline: unified log source and the storage processor.
//!
//! - [`channel`] - backpressured log channel between source and processor
//! - [`source`] - confirmation-windowed merge of fetch and subscribe
//! - [`storage`] - transactional consumer writing the event table

pub mod channel;
pub mod source;
pub mod storage;

pub use channel::{LogChannel, LogReceiver, log_channel};
pub use source::{Ingestor, IngestorConfig, SourceNotice};
pub use storage::{BlockGuard, ParsedEvent, StorageProcessor};
