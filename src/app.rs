//! Application wiring and lifecycle.
//!
//! Components are constructed in dependency order - store, chain access,
//! snapshot driver, API, then the ingestion pipeline and reorg detector -
//! and stopped in reverse through a shared cancellation token. Only this
//! boundary treats errors as fatal; inside the pipeline everything retries
//! or degrades.
//!
//! Modes:
//! - **readonly**: store + snapshot driver + API only; no ingestion.
//! - **disable-websocket**: fetch-mode ingestion on the poll timer.
//! - default: subscribe-mode ingestion with fetch catch-up.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{RequestHandler, serve};
use crate::chain::{BlockCache, ChainRpc, HttpChainClient, LogFetcher, LogSubscriber};
use crate::chain::log_fetcher::LogSubscription;
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::ingest::{Ingestor, IngestorConfig, SourceNotice, StorageProcessor, log_channel};
use crate::mq::{AmqpPublisher, OrderFilledFanout, TracingSink};
use crate::ports::{NotificationSink, SnapshotBackend};
use crate::reorg::{PipelineControl, ReorgConfig, ReorgDetector};
use crate::snapshot::SnapshotDriver;
use crate::store::{self, Stores};

// ═══════════════════════════════════════════════════════════════════════════════
// REORG COORDINATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Wires the detector's rewind sequence to the live components.
struct Coordinator {
    processor: Arc<StorageProcessor>,
    driver: Arc<SnapshotDriver>,
    handler: Arc<RequestHandler>,
}

#[async_trait]
impl PipelineControl for Coordinator {
    async fn block(&self) -> crate::ingest::BlockGuard {
        self.processor.block().await
    }

    async fn snapshot_reorg(&self, reorg_block: u64) -> Result<()> {
        // Generated snapshots and in-flight generations above the divergence
        // die with the stored rows.
        self.handler.on_reorged(reorg_block);
        self.driver.reorg(reorg_block).await
    }

    async fn storage_reorg(&self, reorg_block: u64) -> Result<()> {
        self.processor.reorg(reorg_block).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUN
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_contract(name: &str, text: &str) -> Result<Address> {
    Address::from_str(text)
        .map_err(|e| AppError::Config(format!("bad {name} address {text}: {e}")))
}

/// Run the service until `shutdown` fires.
///
/// # Errors
///
/// Returns an error for startup failures (config, database, bind); runtime
/// failures inside components retry or log instead.
#[allow(clippy::too_many_lines)] // Linear wiring; splitting obscures the order
pub async fn run(settings: Settings, shutdown: CancellationToken) -> Result<()> {
    let chain_id = settings.network.chain_id;
    let gate = parse_contract("gate", &settings.network.contracts.gate)?;
    let config_address = parse_contract("config", &settings.network.contracts.config)?;

    info!(
        network = %settings.network.name,
        chain_id,
        readonly = settings.ingest.readonly,
        "Starting OBELISK indexer"
    );

    // ─── Store ────────────────────────────────────────────────────────────────
    let pool = store::connect(&settings.database).await?;
    let stores = Arc::new(Stores::new(pool, chain_id));
    stores.init().await?;

    // ─── Snapshot driver ──────────────────────────────────────────────────────
    let driver = Arc::new(SnapshotDriver::new(
        Arc::clone(&stores) as Arc<dyn SnapshotBackend>,
        settings.snapshot.interval,
        settings.snapshot.outdated,
    ));
    let driver_task: JoinHandle<Result<()>> = {
        let driver = Arc::clone(&driver);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { driver.run(shutdown).await })
    };

    // ─── API ──────────────────────────────────────────────────────────────────
    let order_filled = Arc::new(parking_lot::RwLock::new(HashSet::new()));
    let handler = Arc::new(RequestHandler::new(
        chain_id,
        Arc::clone(&driver),
        Arc::clone(&stores) as Arc<dyn SnapshotBackend>,
        Arc::clone(&order_filled),
        shutdown.clone(),
        settings.api.request_timeout(),
    ));
    let server_task: JoinHandle<Result<()>> = {
        let handler = Arc::clone(&handler);
        let addr = settings.api.socket_addr();
        let timeout = settings.api.request_timeout();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { serve(handler, addr, timeout, shutdown).await })
    };

    if settings.ingest.readonly {
        info!("Readonly mode: serving queries only");
        shutdown.cancelled().await;
        join(server_task, "api").await;
        join(driver_task, "snapshot driver").await;
        return Ok(());
    }

    // ─── Chain access ─────────────────────────────────────────────────────────
    let client: Arc<dyn ChainRpc> =
        Arc::new(HttpChainClient::connect(&settings.network.rpc_url, chain_id)?);
    let fetcher = Arc::new(LogFetcher::with_parallel(
        Arc::clone(&client),
        settings.ingest.fetch_parallel,
    ));
    fetcher.register(LogSubscription {
        address: gate,
        topics: vec![],
    });
    fetcher.register(LogSubscription {
        address: config_address,
        topics: vec![],
    });
    for record in stores.instruments.all().await? {
        fetcher.register(LogSubscription {
            address: record.address,
            topics: vec![],
        });
    }

    let (subscriber, subscriber_events) = if settings.ingest.disable_websocket {
        info!("WebSocket disabled: fetch-mode ingestion");
        (None, None)
    } else {
        let (subscriber, events) = LogSubscriber::new(&settings.network.ws_url, chain_id);
        let subscriber = Arc::new(subscriber);
        for sub in fetcher.subscriptions() {
            subscriber.register(sub);
        }
        {
            let subscriber = Arc::clone(&subscriber);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { subscriber.run(shutdown).await });
        }
        (Some(subscriber), Some(events))
    };

    // ─── Storage processor ────────────────────────────────────────────────────
    let threshold = settings.ingest.backpressure_threshold;
    let (log_tx, log_rx) = log_channel(threshold);
    let (processor, mut parsed_rx, stored_block_rx) = StorageProcessor::new(
        Arc::clone(&stores) as Arc<dyn crate::ports::EventWriter>,
        gate,
        config_address,
    );
    let processor = Arc::new(processor);
    let processor_task: JoinHandle<Result<()>> = {
        let processor = Arc::clone(&processor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { processor.run(log_rx, shutdown).await })
    };

    // ─── Ingestor ─────────────────────────────────────────────────────────────
    let initial_block = settings
        .ingest
        .from_block
        .unwrap_or(settings.network.initial_block);
    let (ingestor, mut notices_rx) = Ingestor::new(
        Arc::clone(&client),
        Arc::clone(&fetcher),
        subscriber,
        Arc::clone(&stores) as Arc<dyn crate::ports::EventWriter>,
        log_tx,
        IngestorConfig {
            confirmation: settings.ingest.confirmation,
            batch_size: settings.ingest.batch_size,
            initial_block,
            poll_interval: settings.ingest.poll_interval(),
            gate,
        },
    );
    let ingestor = Arc::new(ingestor);
    let ingestor_task: JoinHandle<Result<()>> = {
        let ingestor = Arc::clone(&ingestor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { ingestor.run(subscriber_events, shutdown).await })
    };

    // ─── Notification fan-out + snapshot feed ─────────────────────────────────
    let sink: Arc<dyn NotificationSink> = if settings.amqp.enabled {
        Arc::new(AmqpPublisher::connect(&settings.amqp.url, &settings.amqp.exchange).await?)
    } else {
        Arc::new(TracingSink)
    };
    let fanout = OrderFilledFanout::new(Arc::clone(&order_filled), sink);
    {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move {
            while let Some(parsed) = parsed_rx.recv().await {
                driver.on_parsed(parsed.event.clone(), parsed.parsed.clone());
                fanout.forward(&parsed).await;
            }
        });
    }

    let (synced_tx, synced_rx) = watch::channel(false);
    tokio::spawn(async move {
        while let Some(notice) = notices_rx.recv().await {
            match notice {
                SourceNotice::Synced => {
                    info!("Ingestion synced");
                    let _ = synced_tx.send(true);
                }
                SourceNotice::NewBlock(header) => {
                    tracing::trace!(block = header.number, "New head");
                }
            }
        }
    });

    // ─── Reorg detector ───────────────────────────────────────────────────────
    let blocks = Arc::new(BlockCache::new(Arc::clone(&client)));
    let coordinator = Arc::new(Coordinator {
        processor: Arc::clone(&processor),
        driver: Arc::clone(&driver),
        handler: Arc::clone(&handler),
    });
    let detector = Arc::new(ReorgDetector::new(
        Arc::clone(&stores) as Arc<dyn crate::ports::ReconcileStore>,
        Arc::clone(&fetcher),
        blocks,
        coordinator,
        gate,
        config_address,
        ReorgConfig {
            span: settings.reorg.span,
            delay: settings.reorg.delay,
            interval: settings.reorg.interval,
        },
    ));
    let detector_task: JoinHandle<Result<()>> = {
        let detector = Arc::clone(&detector);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { detector.run(stored_block_rx, synced_rx, shutdown).await })
    };

    info!("All components running");
    shutdown.cancelled().await;
    info!("Shutting down");

    // Reverse dependency order; the snapshot driver drains pending reorg
    // messages before it stops.
    join(ingestor_task, "ingestor").await;
    join(processor_task, "storage processor").await;
    join(driver_task, "snapshot driver").await;
    join(detector_task, "reorg detector").await;
    join(server_task, "api").await;

    info!("Shutdown complete");
    Ok(())
}

async fn join(task: JoinHandle<Result<()>>, name: &str) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(component = name, error = %e, "Component exited with error"),
        Err(e) => error!(component = name, error = %e, "Component task panicked"),
    }
}
