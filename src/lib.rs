//! OBELISK Indexer
//!
//! A self-hosted indexing and snapshot service for the OBELISK on-chain
//! derivatives protocol. The service ingests event logs from a chain node,
//! persists them into block-range-partitioned tables, replays them through a
//! deterministic application state, and exposes a JSON-RPC-over-WebSocket
//! API answering protocol-state queries at any historical position.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  ┌────────────┐   ┌──────────┐   ┌───────────┐   ┌───────────────┐  │
//! │  │ Subscriber │──▶│          │   │  Storage  │──▶│  Event Store  │  │
//! │  │  (push WS) │   │ Ingestor │──▶│ Processor │   │ (partitioned) │  │
//! │  ├────────────┤   │ (confirm │   └─────┬─────┘   └───────┬───────┘  │
//! │  │  Fetcher   │──▶│  window) │         │ parsed          │ replay   │
//! │  │ (getLogs)  │   └──────────┘         ▼                 ▼          │
//! │  └────────────┘                 ┌──────────────┐  ┌──────────────┐  │
//! │       ▲      reconcile          │   Snapshot   │  │   Request    │  │
//! │  ┌────┴────────┐                │    Driver    │◀─│   Handler    │  │
//! │  │    Reorg    │───── rewind ──▶│ (live state) │  │ (JSON-RPC WS)│  │
//! │  │   Detector  │                └──────────────┘  └──────────────┘  │
//! │  └─────────────┘                                                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`types`] - positions, logs, snapshot identifiers
//! - [`error`] - layered error types
//! - [`config`] - configuration loading and validation
//! - [`abi`] - bindings for the Gate / Config / Instrument contracts
//! - [`chain`] - RPC adapter, block cache, log fetcher, WS subscriber
//! - [`ports`] - seams between components and infrastructure
//! - [`store`] - PostgreSQL persistence (partitioned event table)
//! - [`snapshot`] - deterministic state and the live-snapshot driver
//! - [`ingest`] - confirmation-windowed source and storage processor
//! - [`reorg`] - sliding-window reconciliation
//! - [`api`] - the JSON-RPC-over-WebSocket surface
//! - [`mq`] - AMQP notification fan-out
//! - [`app`] - wiring and lifecycle

pub mod abi;
pub mod api;
pub mod app;
pub mod chain;
pub mod config;
pub mod error;
pub mod ingest;
pub mod mq;
pub mod ports;
pub mod reorg;
pub mod snapshot;
pub mod store;
pub mod types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string
#[must_use]
pub const fn version() -> &'static str {
    VERSION
}
