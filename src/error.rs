//! Layered error types for the OBELISK indexer.
//!
//! - [`DomainError`] - protocol-state errors surfaced to API clients with
//!   dedicated JSON-RPC codes (`reorging`, `unavailable`, `generating`, ...)
//! - [`InfraError`] - infrastructure errors (database, RPC, WebSocket, MQ)
//! - [`AppError`] - application-level errors combining the two
//!
//! # Error Philosophy
//!
//! - Domain errors are recoverable and user-facing
//! - Infrastructure errors are retried by the owning component or logged;
//!   details are hidden from API clients
//! - Transactions are the atomicity unit: any error inside one forces a
//!   rollback before retry or propagation

use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// DOMAIN ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Domain-level errors representing protocol-state conditions.
///
/// These map one-to-one onto the public API's error codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DomainError {
    /// The live snapshot is being regenerated after a chain reorganization.
    #[error("snapshot is reorging")]
    Reorging,

    /// No live snapshot exists yet (service still syncing).
    #[error("snapshot unavailable")]
    Unavailable,

    /// A snapshot is still being generated for this id.
    #[error("snapshot {0} is generating")]
    Generating(String),

    /// No generated snapshot under this id.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Instrument address not present in the snapshot.
    #[error("instrument not found: {0}")]
    InstrumentNotFound(String),

    /// No account state for the trader at this instrument/expiry.
    #[error("account not found: {trader} @ {instrument}/{expiry}")]
    AccountNotFound {
        /// Trader address queried.
        trader: String,
        /// Instrument address queried.
        instrument: String,
        /// Pair expiry queried.
        expiry: u32,
    },

    /// No AMM pair at this instrument/expiry.
    #[error("pair not found: {instrument}/{expiry}")]
    PairNotFound {
        /// Instrument address queried.
        instrument: String,
        /// Pair expiry queried.
        expiry: u32,
    },

    /// Malformed request parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Unknown API method.
    #[error("method not found: {0}")]
    MethodNotFound(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// INFRASTRUCTURE ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Infrastructure-level errors from external systems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InfraError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// RPC error (chain node communication).
    #[error("RPC error: {0}")]
    Rpc(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// WebSocket session error.
    #[error("websocket error: {0}")]
    Ws(String),

    /// The WebSocket session dropped; in-flight requests are rejected with
    /// this error.
    #[error("loss connection")]
    ConnectionLost,

    /// AMQP publishing error.
    #[error("mq error: {0}")]
    Mq(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event decoding error.
    #[error("event decoding error: {0}")]
    EventDecoding(String),

    /// Timeout waiting for an operation.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// An internal channel closed unexpectedly.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Catch-all internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// APPLICATION ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Application-level errors combining domain and infrastructure errors.
///
/// This is the primary error type used throughout the service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    /// Domain state error.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Infrastructure error.
    #[error(transparent)]
    Infra(#[from] InfraError),

    /// The operation was cancelled (client disconnect, shutdown, or a reorg
    /// aborting an in-flight snapshot generation).
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error found at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Startup wiring error.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Graceful shutdown requested.
    #[error("shutdown requested")]
    ShutdownRequested,
}

/// Type alias for application Results.
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether the error is transient I/O that the owning component should
    /// retry with backoff rather than propagate.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Infra(
                InfraError::Database(_)
                    | InfraError::Rpc(_)
                    | InfraError::Ws(_)
                    | InfraError::ConnectionLost
                    | InfraError::Timeout(_)
            )
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_error_display() {
        let err = DomainError::Generating("81457-100".into());
        assert!(err.to_string().contains("81457-100"));
    }

    #[test]
    fn app_error_from_domain() {
        let app: AppError = DomainError::Reorging.into();
        assert!(matches!(app, AppError::Domain(DomainError::Reorging)));
    }

    #[test]
    fn transient_classification() {
        let transient: AppError = InfraError::ConnectionLost.into();
        assert!(transient.is_transient());

        let fatal = AppError::Initialization("missing RPC url".into());
        assert!(!fatal.is_transient());
    }

    #[test]
    fn connection_loss_message_is_stable() {
        // In-flight request rejections carry this exact message.
        assert_eq!(InfraError::ConnectionLost.to_string(), "loss connection");
    }
}
