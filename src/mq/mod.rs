//! AMQP notification fan-out.
//!
//! Selected parsed events (order fills) are published to a topic exchange
//! with routing key `{chain_id}.{event_name}`. The address filter is
//! authoritative: only fills whose trader is in the subscribed set (managed
//! over the API) are published, and reorg replays are never re-published.

use std::collections::HashSet;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, instrument, warn};

use crate::abi::ProtocolEvent;
use crate::error::{InfraError, Result};
use crate::ingest::ParsedEvent;
use crate::ports::{Notification, NotificationSink};

// ═══════════════════════════════════════════════════════════════════════════════
// AMQP PUBLISHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Publisher over a durable topic exchange.
pub struct AmqpPublisher {
    channel: Channel,
    exchange: String,
}

impl std::fmt::Debug for AmqpPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpPublisher")
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

impl AmqpPublisher {
    /// Connect to the broker and declare the exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or declaration fails.
    #[instrument(skip_all, fields(exchange))]
    pub async fn connect(url: &str, exchange: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| InfraError::Mq(Box::new(e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| InfraError::Mq(Box::new(e)))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| InfraError::Mq(Box::new(e)))?;

        info!(%exchange, "AMQP publisher connected");
        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for AmqpPublisher {
    async fn publish(&self, notification: Notification) -> Result<()> {
        let routing_key = format!("{}.{}", notification.chain_id, notification.name);
        let payload =
            serde_json::to_vec(&notification).map_err(InfraError::Serialization)?;

        self.channel
            .basic_publish(
                &self.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| InfraError::Mq(Box::new(e)))?
            .await
            .map_err(|e| InfraError::Mq(Box::new(e)))?;

        debug!(%routing_key, "Notification published");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACING SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Sink for deployments without a broker: notifications go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, notification: Notification) -> Result<()> {
        debug!(
            name = %notification.name,
            position = %notification.position,
            "Notification (no broker configured)"
        );
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORDER-FILLED FILTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Address-filtered forwarder from the parsed-event hook to the sink.
pub struct OrderFilledFanout {
    addresses: Arc<parking_lot::RwLock<HashSet<Address>>>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for OrderFilledFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderFilledFanout")
            .field("subscribed", &self.addresses.read().len())
            .finish_non_exhaustive()
    }
}

impl OrderFilledFanout {
    /// Create a fan-out over `sink`. The address set is shared with the API
    /// handler's subscribe/unsubscribe methods.
    #[must_use]
    pub fn new(
        addresses: Arc<parking_lot::RwLock<HashSet<Address>>>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { addresses, sink }
    }

    /// Forward one parsed event if it passes the filter.
    pub async fn forward(&self, parsed: &ParsedEvent) {
        // Replays must not re-notify.
        if parsed.processed {
            return;
        }
        let ProtocolEvent::Fill(fill) = &parsed.parsed else {
            return;
        };
        if !self.addresses.read().contains(&fill.trader) {
            return;
        }

        let notification = Notification {
            chain_id: parsed.event.log.chain_id,
            name: parsed.parsed.name().to_string(),
            position: parsed.event.position(),
            payload: parsed.event.payload.clone(),
        };
        if let Err(e) = self.sink.publish(notification).await {
            warn!(error = %e, "Notification publish failed");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::primitives::{B256, Bytes, I256, U256};

    use crate::abi::instrument;
    use crate::types::{ChainLog, EventStatus, StoredEvent};

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingSink {
        published: parking_lot::Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish(&self, notification: Notification) -> Result<()> {
            self.published.lock().push(notification);
            Ok(())
        }
    }

    fn fill_event(trader: Address, processed: bool) -> ParsedEvent {
        let parsed = ProtocolEvent::Fill(instrument::Fill {
            trader,
            expiry: u32::MAX,
            oid: 1,
            size: I256::try_from(100).unwrap(),
            fee: U256::from(1u64),
            operatorFee: U256::ZERO,
        });
        ParsedEvent {
            event: StoredEvent {
                log: ChainLog {
                    chain_id: 81457,
                    address: Address::repeat_byte(0x14),
                    block_number: 100,
                    block_hash: B256::repeat_byte(1),
                    tx_hash: B256::repeat_byte(2),
                    transaction_index: 0,
                    log_index: 0,
                    topics: vec![],
                    data: Bytes::new(),
                    removed: false,
                },
                name: "Fill".into(),
                payload: parsed.to_payload().unwrap(),
                timestamp: None,
                status: EventStatus::default().processed(),
            },
            parsed,
            processed,
        }
    }

    #[tokio::test]
    async fn filter_is_authoritative() {
        let trader = Address::repeat_byte(0x77);
        let addresses = Arc::new(parking_lot::RwLock::new(HashSet::new()));
        let sink = Arc::new(RecordingSink::default());
        let fanout = OrderFilledFanout::new(
            Arc::clone(&addresses),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );

        // Unsubscribed: dropped.
        fanout.forward(&fill_event(trader, false)).await;
        assert!(sink.published.lock().is_empty());

        // Subscribed: published with the routing name.
        addresses.write().insert(trader);
        fanout.forward(&fill_event(trader, false)).await;
        let published = sink.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].name, "Fill");
        assert_eq!(published[0].chain_id, 81457);
    }

    #[tokio::test]
    async fn replays_are_not_republished() {
        let trader = Address::repeat_byte(0x77);
        let addresses = Arc::new(parking_lot::RwLock::new(HashSet::from([trader])));
        let sink = Arc::new(RecordingSink::default());
        let fanout = OrderFilledFanout::new(
            addresses,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );

        fanout.forward(&fill_event(trader, true)).await;
        assert!(sink.published.lock().is_empty());
    }
}
