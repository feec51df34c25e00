//! Outbound notification port.
//!
//! Selected parsed events fan out to a message broker. The pipeline only
//! knows this trait; `mq/` provides the AMQP implementation and a
//! tracing-only sink for deployments without a broker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::LogPosition;

/// A notification emitted towards external consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Chain the event happened on.
    pub chain_id: u64,
    /// Event name (routing key suffix).
    pub name: String,
    /// Position of the source log.
    pub position: LogPosition,
    /// Serialized event arguments.
    pub payload: serde_json::Value,
}

/// Sink for outbound notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publish one notification; implementations decide delivery semantics.
    ///
    /// # Errors
    ///
    /// Returns an error when the broker rejects the publish.
    async fn publish(&self, notification: Notification) -> Result<()>;
}
