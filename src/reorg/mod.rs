//! Reorg detection by sliding-window reconciliation.
//!
//! After the source reports `synced`, every stored-block advance may trigger
//! a reconciliation pass over a trailing window `[to - span, to]` where
//! `to = min(n - delay, latest_stored - 1)`:
//!
//! 1. Stored events in the window are loaded into a map by synthetic id.
//! 2. The same window is re-fetched from the node and sorted by position.
//!    Fetched logs already in the map are checked off; unknown ones are
//!    parsed, time-stamped via the block cache, and queued for back-fill,
//!    and the lowest such block becomes the divergence point.
//! 3. Stored events that the node no longer reports are **never deleted** -
//!    a deliberately conservative policy. A lying upstream can therefore
//!    accumulate phantom rows; operators monitor the leftover warnings.
//! 4. Back-fill commits transactionally with bounded retry.
//! 5. On divergence, the pipeline rewinds in strict order: storage blocks,
//!    the snapshot driver rewinds and regenerates, storage reprocesses, and
//!    only then does the block release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abi::{ContractKind, ProtocolEvent};
use crate::chain::block_cache::BlockCache;
use crate::chain::log_fetcher::LogFetcher;
use crate::error::Result;
use crate::ports::ReconcileStore;
use crate::types::{EventStatus, StoredEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Back-fill commit attempts.
const SAVE_RETRIES: u32 = 3;

/// Gap between those attempts.
const SAVE_RETRY_GAP: Duration = Duration::from_millis(333);

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE CONTROL
// ═══════════════════════════════════════════════════════════════════════════════

/// The coordinated-rewind seam: the detector drives it in a strict order and
/// the application wires it to the storage processor and snapshot driver.
#[async_trait]
pub trait PipelineControl: Send + Sync {
    /// Exclusive guard over storage processing; any in-flight batch
    /// completes first, and no new batch starts while the guard lives.
    async fn block(&self) -> crate::ingest::BlockGuard;

    /// Rewind and regenerate the live snapshot below `reorg_block`.
    ///
    /// # Errors
    ///
    /// Returns an error if regeneration fails.
    async fn snapshot_reorg(&self, reorg_block: u64) -> Result<()>;

    /// Re-process stored events from `reorg_block` onward.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay fails.
    async fn storage_reorg(&self, reorg_block: u64) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// REORG DETECTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for [`ReorgDetector`].
#[derive(Debug, Clone, Copy)]
pub struct ReorgConfig {
    /// Width of the reconciliation window.
    pub span: u64,
    /// Trailing distance from the stored head.
    pub delay: u64,
    /// Minimum block gap between reconciliation runs.
    pub interval: u64,
}

/// See the module docs.
pub struct ReorgDetector {
    store: Arc<dyn ReconcileStore>,
    fetcher: Arc<LogFetcher>,
    blocks: Arc<BlockCache>,
    control: Arc<dyn PipelineControl>,
    gate: Address,
    config_address: Address,
    config: ReorgConfig,
}

impl std::fmt::Debug for ReorgDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReorgDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReorgDetector {
    /// Create a detector.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReconcileStore>,
        fetcher: Arc<LogFetcher>,
        blocks: Arc<BlockCache>,
        control: Arc<dyn PipelineControl>,
        gate: Address,
        config_address: Address,
        config: ReorgConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            blocks,
            control,
            gate,
            config_address,
            config,
        }
    }

    /// Run until shutdown. `stored_blocks` is the storage processor's
    /// watermark; `synced` gates the first reconciliation. One pass finishes
    /// before the next trigger is considered.
    ///
    /// # Errors
    ///
    /// Returns an error only when a coordinated rewind fails irrecoverably.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut stored_blocks: watch::Receiver<u64>,
        synced: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut last_checked = 0u64;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Reorg detector stopped");
                    return Ok(());
                }

                changed = stored_blocks.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let n = *stored_blocks.borrow_and_update();
                    if !*synced.borrow() {
                        continue;
                    }
                    let window = match self.window(n, last_checked).await {
                        Ok(window) => window,
                        Err(e) => {
                            warn!(error = %e, "Window computation failed");
                            continue;
                        }
                    };
                    if let Some((from, to)) = window {
                        // Transient failures retry on the next trigger.
                        match self.reconcile(from, to).await {
                            Ok(()) => last_checked = from,
                            Err(e) => warn!(error = %e, "Reconciliation failed"),
                        }
                    }
                }
            }
        }
    }

    /// The reconciliation window for stored-block watermark `n`, or `None`
    /// when the interval gate holds it back.
    async fn window(&self, n: u64, last_checked: u64) -> Result<Option<(u64, u64)>> {
        let Some(latest_stored) = self.store.latest_stored_block().await? else {
            return Ok(None);
        };
        let to = n
            .saturating_sub(self.config.delay)
            .min(latest_stored.saturating_sub(1));
        let from = to.saturating_sub(self.config.span);
        if last_checked + self.config.interval <= from {
            Ok(Some((from, to)))
        } else {
            Ok(None)
        }
    }

    /// One reconciliation pass over `[from, to]`.
    #[instrument(skip(self))]
    async fn reconcile(&self, from: u64, to: u64) -> Result<()> {
        debug!("Reconciling window");

        // 1. Stored view, by id.
        let mut known: HashMap<_, _> = self
            .store
            .events_in_range(from, to)
            .await?
            .into_iter()
            .map(|e| (e.id(), e))
            .collect();

        // 2. Node view.
        let mut fetched = self.fetcher.fetch(from, to).await?;
        fetched.sort_by_key(crate::types::ChainLog::position);

        let mut need_save: Vec<StoredEvent> = Vec::new();
        let mut reorged_block: Option<u64> = None;

        for log in fetched {
            if known.remove(&log.id()).is_some() {
                continue;
            }

            let kind = self.kind_for(log.address);
            let parsed = match ProtocolEvent::decode(kind, &log.to_primitive()) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(e) => {
                    warn!(position = %log.position(), error = %e, "Parse failed, skipping");
                    continue;
                }
            };

            let timestamp = match self.blocks.get_block(log.block_number).await {
                Ok(header) => Some(i64::try_from(header.timestamp).unwrap_or(i64::MAX)),
                Err(e) => {
                    warn!(block = log.block_number, error = %e, "Block timestamp unavailable");
                    None
                }
            };

            reorged_block =
                Some(reorged_block.map_or(log.block_number, |b| b.min(log.block_number)));
            need_save.push(StoredEvent {
                name: parsed.name().to_string(),
                payload: parsed.to_payload()?,
                timestamp,
                status: EventStatus::default().processed(),
                log,
            });
        }

        // 3. Leftovers: the node no longer reports them, but they are kept.
        if !known.is_empty() {
            warn!(
                count = known.len(),
                from, to, "Stored events missing from node view (kept)"
            );
        }

        // 4. Transactional back-fill with bounded retry.
        if !need_save.is_empty() {
            self.save_with_retry(need_save).await?;
        }

        // 5. Coordinated rewind.
        if let Some(reorg_block) = reorged_block {
            info!(reorg_block, "Divergence found, rewinding pipeline");
            let guard = self.control.block().await;
            self.control.snapshot_reorg(reorg_block).await?;
            self.control.storage_reorg(reorg_block).await?;
            drop(guard);
            info!(reorg_block, "Pipeline rewind complete");
        }

        Ok(())
    }

    async fn save_with_retry(&self, events: Vec<StoredEvent>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.store.save_events(events.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= SAVE_RETRIES {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "Back-fill commit failed, retrying");
                    tokio::time::sleep(SAVE_RETRY_GAP).await;
                }
            }
        }
    }

    fn kind_for(&self, address: Address) -> ContractKind {
        if address == self.gate {
            ContractKind::Gate
        } else if address == self.config_address {
            ContractKind::Config
        } else {
            ContractKind::Instrument
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::primitives::{B256, Bytes, U256};
    use alloy::sol_types::SolEvent;
    use parking_lot::Mutex;

    use crate::abi::gate;
    use crate::chain::client::{BlockHeader, ChainRpc};
    use crate::chain::log_fetcher::LogSubscription;
    use crate::error::Result as AppResult;
    use crate::types::ChainLog;

    use super::*;

    const GATE: Address = Address::repeat_byte(0x0A);

    fn deposit_log(block: u64, log_index: u64, salt: u8) -> ChainLog {
        let event = gate::Deposit {
            quote: Address::repeat_byte(0x01),
            trader: Address::repeat_byte(salt),
            quantity: U256::from(7u64),
        };
        ChainLog {
            chain_id: 1,
            address: GATE,
            block_number: block,
            block_hash: B256::repeat_byte(salt),
            tx_hash: B256::repeat_byte(0x40),
            transaction_index: 0,
            log_index,
            topics: event.encode_topics().into_iter().map(|t| t.0).collect(),
            data: event.encode_data().into(),
            removed: false,
        }
    }

    fn stored(log: &ChainLog) -> StoredEvent {
        StoredEvent {
            log: log.clone(),
            name: "Deposit".into(),
            payload: serde_json::json!({}),
            timestamp: None,
            status: EventStatus::default().processed(),
        }
    }

    #[derive(Default)]
    struct MemReconcileStore {
        events: Mutex<Vec<StoredEvent>>,
        saved: Mutex<Vec<StoredEvent>>,
    }

    #[async_trait]
    impl ReconcileStore for MemReconcileStore {
        async fn events_in_range(
            &self,
            from_block: u64,
            to_block: u64,
        ) -> AppResult<Vec<StoredEvent>> {
            Ok(self
                .events
                .lock()
                .iter()
                .filter(|e| {
                    e.log.block_number >= from_block && e.log.block_number <= to_block
                })
                .cloned()
                .collect())
        }

        async fn save_events(&self, events: Vec<StoredEvent>) -> AppResult<()> {
            self.saved.lock().extend(events.clone());
            self.events.lock().extend(events);
            Ok(())
        }

        async fn latest_stored_block(&self) -> AppResult<Option<u64>> {
            Ok(self.events.lock().iter().map(|e| e.log.block_number).max())
        }
    }

    struct ScriptedRpc {
        logs: Mutex<Vec<ChainLog>>,
    }

    #[async_trait]
    impl ChainRpc for ScriptedRpc {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn get_logs(
            &self,
            from: u64,
            to: u64,
            address: Address,
            _topics: &[B256],
        ) -> AppResult<Vec<ChainLog>> {
            Ok(self
                .logs
                .lock()
                .iter()
                .filter(|l| l.address == address && l.block_number >= from && l.block_number <= to)
                .cloned()
                .collect())
        }

        async fn get_block(&self, number: u64) -> AppResult<Option<BlockHeader>> {
            Ok(Some(BlockHeader {
                number,
                hash: B256::repeat_byte(0x11),
                parent_hash: B256::ZERO,
                timestamp: 1_700_000_000 + number,
            }))
        }

        async fn block_number(&self) -> AppResult<u64> {
            Ok(1_000)
        }
    }

    /// Records the rewind call order.
    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<String>>,
        lock: std::sync::OnceLock<Arc<tokio::sync::Mutex<()>>>,
    }

    impl RecordingControl {
        fn lock(&self) -> Arc<tokio::sync::Mutex<()>> {
            Arc::clone(self.lock.get_or_init(|| Arc::new(tokio::sync::Mutex::new(()))))
        }
    }

    #[async_trait]
    impl PipelineControl for RecordingControl {
        async fn block(&self) -> crate::ingest::BlockGuard {
            self.calls.lock().push("block".into());
            self.lock().lock_owned().await
        }

        async fn snapshot_reorg(&self, reorg_block: u64) -> Result<()> {
            self.calls.lock().push(format!("snapshot:{reorg_block}"));
            Ok(())
        }

        async fn storage_reorg(&self, reorg_block: u64) -> Result<()> {
            self.calls.lock().push(format!("storage:{reorg_block}"));
            Ok(())
        }
    }

    fn detector(
        store: Arc<MemReconcileStore>,
        rpc: Arc<ScriptedRpc>,
        control: Arc<RecordingControl>,
    ) -> ReorgDetector {
        let fetcher = Arc::new(LogFetcher::new(Arc::clone(&rpc) as Arc<dyn ChainRpc>));
        fetcher.register(LogSubscription {
            address: GATE,
            topics: vec![],
        });
        let blocks = Arc::new(BlockCache::new(rpc as Arc<dyn ChainRpc>));
        ReorgDetector::new(
            store as Arc<dyn ReconcileStore>,
            fetcher,
            blocks,
            control as Arc<dyn PipelineControl>,
            GATE,
            Address::repeat_byte(0x0B),
            ReorgConfig {
                span: 100,
                delay: 10,
                interval: 10,
            },
        )
    }

    #[tokio::test]
    async fn matching_views_change_nothing() {
        let store = Arc::new(MemReconcileStore::default());
        let rpc = Arc::new(ScriptedRpc {
            logs: Mutex::new(vec![]),
        });
        let control = Arc::new(RecordingControl::default());

        // Same three logs on both sides.
        for block in [100u64, 101, 102] {
            let log = deposit_log(block, 0, 0x50);
            store.events.lock().push(stored(&log));
            rpc.logs.lock().push(log);
        }

        let detector = detector(Arc::clone(&store), rpc, Arc::clone(&control));
        detector.reconcile(100, 102).await.unwrap();

        assert!(store.saved.lock().is_empty());
        assert!(control.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_fetched_log_backfills_and_rewinds() {
        let store = Arc::new(MemReconcileStore::default());
        let rpc = Arc::new(ScriptedRpc {
            logs: Mutex::new(vec![]),
        });
        let control = Arc::new(RecordingControl::default());

        // Stored: block 100 only. Node: block 100 plus an unseen log at 98.
        let shared = deposit_log(100, 0, 0x50);
        store.events.lock().push(stored(&shared));
        rpc.logs.lock().push(shared);
        rpc.logs.lock().push(deposit_log(98, 1, 0x60));

        let detector = detector(Arc::clone(&store), rpc, Arc::clone(&control));
        detector.reconcile(90, 101).await.unwrap();

        // Back-filled with its block timestamp.
        let saved = store.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].log.block_number, 98);
        assert_eq!(saved[0].timestamp, Some(1_700_000_098));

        // Coordinated rewind in strict order at the divergence block.
        assert_eq!(
            *control.calls.lock(),
            vec!["block", "snapshot:98", "storage:98"]
        );
    }

    #[tokio::test]
    async fn leftover_stored_events_are_never_deleted() {
        let store = Arc::new(MemReconcileStore::default());
        let rpc = Arc::new(ScriptedRpc {
            logs: Mutex::new(vec![]),
        });
        let control = Arc::new(RecordingControl::default());

        // Stored event the node no longer reports.
        let phantom = deposit_log(99, 0, 0x70);
        store.events.lock().push(stored(&phantom));

        let detector = detector(Arc::clone(&store), rpc, Arc::clone(&control));
        detector.reconcile(90, 101).await.unwrap();

        // Still there; no rewind was triggered.
        assert_eq!(store.events.lock().len(), 1);
        assert!(control.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn window_respects_delay_and_interval() {
        let store = Arc::new(MemReconcileStore::default());
        store.events.lock().push(stored(&deposit_log(500, 0, 1)));
        let rpc = Arc::new(ScriptedRpc {
            logs: Mutex::new(vec![]),
        });
        let control = Arc::new(RecordingControl::default());
        let detector = detector(store, rpc, control);

        // n=500, delay=10, latest_stored=500 → to = min(490, 499) = 490,
        // from = 390.
        let window = detector.window(500, 0).await.unwrap();
        assert_eq!(window, Some((390, 490)));

        // Interval gate: last_checked too close to from.
        let window = detector.window(500, 385).await.unwrap();
        assert_eq!(window, None);
    }
}
