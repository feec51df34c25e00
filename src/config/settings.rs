//! Settings structs and loading logic.
//!
//! All settings have sensible defaults and can be overridden via
//! configuration files, environment variables, or CLI flags.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Target network and contract addresses.
    pub network: NetworkSettings,
    /// Database configuration.
    pub database: DatabaseSettings,
    /// AMQP notification fan-out configuration.
    pub amqp: AmqpSettings,
    /// JSON-RPC API server configuration.
    pub api: ApiSettings,
    /// Ingestion pipeline configuration.
    pub ingest: IngestSettings,
    /// Snapshot persistence configuration.
    pub snapshot: SnapshotSettings,
    /// Reorg detector configuration.
    pub reorg: ReorgSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Settings {
    /// Load settings for a named network.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration is invalid or cannot be loaded.
    pub fn load(network: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());
        let upper = network.to_uppercase().replace('-', "_");

        let mut builder = Config::builder()
            .set_default("network.name", network)?
            .set_default("network.chain_id", default_chain_id(network))?
            .set_default("network.rpc_url", "http://localhost:8545")?
            .set_default("network.ws_url", "ws://localhost:8546")?
            .set_default("network.initial_block", 0)?
            .set_default(
                "network.contracts.gate",
                "0x0000000000000000000000000000000000000001",
            )?
            .set_default(
                "network.contracts.config",
                "0x0000000000000000000000000000000000000002",
            )?
            .set_default("database.url", "postgres://localhost/obelisk")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 1)?
            .set_default("database.connect_timeout_ms", 5000)?
            .set_default("amqp.url", "amqp://localhost:5672")?
            .set_default("amqp.exchange", "obelisk.events")?
            .set_default("amqp.enabled", false)?
            .set_default("api.host", "0.0.0.0")?
            .set_default("api.port", 43210)?
            .set_default("api.request_timeout_ms", 3000)?
            .set_default("ingest.confirmation", 2)?
            .set_default("ingest.batch_size", 1000)?
            .set_default("ingest.backpressure_threshold", 10000)?
            .set_default("ingest.poll_interval_ms", 3000)?
            .set_default("ingest.fetch_parallel", 10)?
            .set_default("ingest.disable_websocket", false)?
            .set_default("ingest.readonly", false)?
            .set_default("ingest.from_block", Option::<u64>::None)?
            .set_default("snapshot.interval", 1800)?
            .set_default("snapshot.outdated", 43200)?
            .set_default("reorg.span", 100)?
            .set_default("reorg.delay", 10)?
            .set_default("reorg.interval", 10)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            .add_source(File::with_name(&format!("{config_dir}/{network}")).required(false))
            .add_source(
                Environment::with_prefix("INDEXER")
                    .separator("__")
                    .try_parsing(true),
            );

        // Dedicated environment variables take precedence over everything
        // except CLI flags.
        if let Ok(url) = std::env::var("API_DB_URL") {
            builder = builder.set_override("database.url", url)?;
        }
        if let Ok(url) = std::env::var("AMQP_URL") {
            builder = builder
                .set_override("amqp.url", url)?
                .set_override("amqp.enabled", true)?;
        }
        if let Ok(url) = std::env::var(format!("{upper}_RPC")) {
            builder = builder.set_override("network.rpc_url", url)?;
        }
        if let Ok(url) = std::env::var(format!("{upper}_WSS")) {
            builder = builder.set_override("network.ws_url", url)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate settings and return any validation errors.
    ///
    /// # Errors
    ///
    /// Returns a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.network.rpc_url.is_empty() {
            errors.push("network.rpc_url cannot be empty".into());
        }
        if self.network.chain_id == 0 {
            errors.push("network.chain_id must be non-zero".into());
        }
        if self.database.url.is_empty() {
            errors.push("database.url cannot be empty".into());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be non-zero".into());
        }
        if self.database.min_connections > self.database.max_connections {
            errors.push("database.min_connections cannot exceed max_connections".into());
        }
        if self.api.port == 0 {
            errors.push("api.port must be non-zero".into());
        }
        if self.ingest.batch_size == 0 {
            errors.push("ingest.batch_size must be non-zero".into());
        }
        if self.ingest.fetch_parallel == 0 {
            errors.push("ingest.fetch_parallel must be non-zero".into());
        }
        if self.snapshot.interval == 0 {
            errors.push("snapshot.interval must be non-zero".into());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Well-known chain ids for named networks; unknown names default to a local
/// devnet id and rely on config to override.
fn default_chain_id(network: &str) -> u64 {
    match network {
        "ethereum" | "mainnet" => 1,
        "base" => 8453,
        "blast" => 81457,
        "arbitrum" => 42161,
        _ => 31337,
    }
}

/// Target network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    /// Network name (`-n` flag / `API_NETWORK`).
    pub name: String,
    /// Chain id.
    pub chain_id: u64,
    /// HTTP RPC endpoint.
    pub rpc_url: String,
    /// WebSocket RPC endpoint (subscribe mode).
    pub ws_url: String,
    /// First block to index when the store is empty.
    pub initial_block: u64,
    /// Static contract addresses.
    pub contracts: ContractSettings,
}

/// Static contract addresses (instruments are discovered at runtime).
#[derive(Debug, Clone, Deserialize)]
pub struct ContractSettings {
    /// Gate contract address.
    pub gate: String,
    /// Config contract address.
    pub config: String,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL (`API_DB_URL`).
    pub url: String,
    /// Maximum connections in the pool.
    pub max_connections: u32,
    /// Minimum connections to maintain.
    pub min_connections: u32,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl DatabaseSettings {
    /// Get the connection timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// AMQP notification fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AmqpSettings {
    /// AMQP broker URL (`AMQP_URL`).
    pub url: String,
    /// Exchange notifications are published to.
    pub exchange: String,
    /// Whether the fan-out is active (implied by `AMQP_URL` being set).
    pub enabled: bool,
}

/// JSON-RPC API server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    /// Host to bind to (`-h`).
    pub host: String,
    /// Port to listen on (`-p`).
    pub port: u16,
    /// Per-request handler timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl ApiSettings {
    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the socket address string.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ingestion pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    /// Confirmation window in blocks (`-m confirmation=`).
    pub confirmation: u64,
    /// Blocks per `getLogs` range during sync.
    pub batch_size: u64,
    /// Downstream channel depth that suspends the sync loop.
    pub backpressure_threshold: usize,
    /// Fetch-mode poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Concurrent `getLogs` calls per fetch.
    pub fetch_parallel: usize,
    /// Run in fetch mode only (`--disable-websocket`).
    pub disable_websocket: bool,
    /// Serve queries without ingesting (`--readonly`).
    pub readonly: bool,
    /// Override for the first block to index (`-f`).
    pub from_block: Option<u64>,
}

impl IngestSettings {
    /// Get the poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotSettings {
    /// Persist the live snapshot every this many blocks (`-i`).
    pub interval: u64,
    /// Snapshots older than this many blocks are pruned (`-o`).
    pub outdated: u64,
}

/// Reorg detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReorgSettings {
    /// Width of the reconciliation window in blocks.
    pub span: u64,
    /// Trailing distance from the stored head.
    pub delay: u64,
    /// Minimum block gap between reconciliation runs.
    pub interval: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error) (`-l`).
    pub level: String,
    /// Log format (json, pretty).
    pub format: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn create_valid_settings() -> Settings {
        Settings {
            network: NetworkSettings {
                name: "blast".into(),
                chain_id: 81457,
                rpc_url: "http://localhost:8545".into(),
                ws_url: "ws://localhost:8546".into(),
                initial_block: 0,
                contracts: ContractSettings {
                    gate: "0x0000000000000000000000000000000000000001".into(),
                    config: "0x0000000000000000000000000000000000000002".into(),
                },
            },
            database: DatabaseSettings {
                url: "postgres://localhost/test".into(),
                max_connections: 10,
                min_connections: 1,
                connect_timeout_ms: 5000,
            },
            amqp: AmqpSettings {
                url: "amqp://localhost:5672".into(),
                exchange: "obelisk.events".into(),
                enabled: false,
            },
            api: ApiSettings {
                host: "0.0.0.0".into(),
                port: 43210,
                request_timeout_ms: 3000,
            },
            ingest: IngestSettings {
                confirmation: 2,
                batch_size: 1000,
                backpressure_threshold: 10000,
                poll_interval_ms: 3000,
                fetch_parallel: 10,
                disable_websocket: false,
                readonly: false,
                from_block: None,
            },
            snapshot: SnapshotSettings {
                interval: 1800,
                outdated: 43200,
            },
            reorg: ReorgSettings {
                span: 100,
                delay: 10,
                interval: 10,
            },
            logging: LoggingSettings {
                level: "info".into(),
                format: "pretty".into(),
            },
        }
    }

    #[test]
    fn default_chain_ids() {
        assert_eq!(default_chain_id("blast"), 81457);
        assert_eq!(default_chain_id("base"), 8453);
        assert_eq!(default_chain_id("somedevnet"), 31337);
    }

    #[test]
    fn valid_settings_pass_validation() {
        assert!(create_valid_settings().validate().is_ok());
    }

    #[test]
    fn validation_catches_zero_connections() {
        let mut settings = create_valid_settings();
        settings.database.max_connections = 0;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_connections")));
    }

    #[test]
    fn validation_catches_min_exceeds_max() {
        let mut settings = create_valid_settings();
        settings.database.min_connections = 20;
        settings.database.max_connections = 10;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("min_connections")));
    }

    #[test]
    fn api_socket_addr() {
        let settings = create_valid_settings();
        assert_eq!(settings.api.socket_addr(), "0.0.0.0:43210");
    }
}
