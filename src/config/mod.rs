//! Configuration loading and validation.
//!
//! Configuration is layered, later sources overriding earlier ones:
//!
//! 1. Built-in defaults
//! 2. `config/default.toml`, then `config/{network}.toml` (both optional)
//! 3. Environment variables with the `INDEXER_` prefix (`__` separator)
//! 4. The service's dedicated variables: `API_DB_URL`, `AMQP_URL`,
//!    `API_NETWORK`, and per-network `{NETWORK}_RPC` / `{NETWORK}_WSS`
//!
//! CLI flags are applied on top by the binary.

mod settings;

pub use settings::{
    AmqpSettings, ApiSettings, ContractSettings, DatabaseSettings, IngestSettings,
    LoggingSettings, NetworkSettings, ReorgSettings, Settings, SnapshotSettings,
};
