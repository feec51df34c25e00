//! JSON-RPC 2.0 envelope and error-code mapping.
//!
//! The wire contract is fixed: standard codes `-32700` (parse), `-32600`
//! (invalid request/params), `-32601` (not found), `-32603` (internal),
//! `-32000` (server), plus the domain codes `100` (reorging), `101`
//! (unavailable), and `102` (generating).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, DomainError};

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

/// Wire error codes.
pub mod codes {
    /// Malformed JSON frame.
    pub const PARSE: i64 = -32700;
    /// Invalid request or parameters.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method or missing resource.
    pub const NOT_FOUND: i64 = -32601;
    /// Internal error.
    pub const INTERNAL: i64 = -32603;
    /// Server error (timeouts, cancellation).
    pub const SERVER: i64 = -32000;
    /// Live snapshot is regenerating after a reorg.
    pub const REORGING: i64 = 100;
    /// No live snapshot yet.
    pub const UNAVAILABLE: i64 = 101;
    /// Snapshot generation still in progress.
    pub const GENERATING: i64 = 102;
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENVELOPE
// ═══════════════════════════════════════════════════════════════════════════════

/// An incoming request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    /// Protocol version; must be `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Correlation id; absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// A wire error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    /// Error code (see [`codes`]).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

impl RpcError {
    /// Build an error with a code and message.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&AppError> for RpcError {
    fn from(error: &AppError) -> Self {
        let code = match error {
            AppError::Domain(domain) => match domain {
                DomainError::Reorging => codes::REORGING,
                DomainError::Unavailable => codes::UNAVAILABLE,
                DomainError::Generating(_) => codes::GENERATING,
                DomainError::InvalidParams(_) => codes::INVALID_REQUEST,
                DomainError::MethodNotFound(_)
                | DomainError::SnapshotNotFound(_)
                | DomainError::InstrumentNotFound(_)
                | DomainError::AccountNotFound { .. }
                | DomainError::PairNotFound { .. } => codes::NOT_FOUND,
            },
            AppError::Cancelled | AppError::ShutdownRequested => codes::SERVER,
            _ => codes::INTERNAL,
        };
        Self::new(code, error.to_string())
    }
}

/// An outgoing response frame.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Echoed correlation id.
    pub id: Value,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// A success response.
    #[must_use]
    pub const fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failure response.
    #[must_use]
    pub const fn fail(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
