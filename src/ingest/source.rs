//! Unified log source: confirmation-windowed merge of fetch and subscribe.
//!
//! The ingestor turns two inputs - periodic `getLogs` range scans and
//! push-based WebSocket subscriptions - into a single ordered stream of
//! *confirmed* logs. A log at block `b` stays in the confirming queue while
//! `b > head - C` and is released downstream, in position order, once the
//! head advances past it.
//!
//! # Sync loop
//!
//! Runs at startup, on every (re)connect, and on the fetch-mode timer:
//!
//! 1. Take the node head as `target`; drop pending subscription logs below
//!    it (the range fetch is authoritative there).
//! 2. Walk `[current, target]` in `batch_size` ranges; sort each batch by
//!    position.
//! 3. Scan for `NewInstrument` discoveries: register the new market with
//!    fetcher and subscriber, re-fetch the same range for that instrument
//!    alone (bounded retries - freshly indexed nodes lag), merge and
//!    re-sort, and reset `target` to the current head.
//! 4. Split each batch at `target - C`: older logs flow downstream
//!    (suspending on backpressure), newer ones wait in the confirming queue.
//! 5. At the natural end, extend `target` to cover pending
//!    subscription logs from the future, else re-query the head (at most 10
//!    times) before stopping.
//! 6. Flush pending subscription logs through the same confirmation split.
//!
//! The `synced` notice fires exactly once, after the first sync pass has
//! completed and the downstream channel has drained.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abi::{ContractKind, ProtocolEvent};
use crate::chain::client::{BlockHeader, ChainRpc};
use crate::chain::log_fetcher::{LogFetcher, LogSubscription};
use crate::chain::subscriber::{LogSubscriber, SubscriberEvent};
use crate::error::{AppError, Result};
use crate::ports::EventWriter;
use crate::types::{ChainLog, LogPosition};

use super::channel::LogChannel;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempts at a single-instrument catch-up fetch that comes back empty.
const DISCOVERY_RETRIES: u32 = 30;

/// Gap between those attempts.
const DISCOVERY_RETRY_GAP: Duration = Duration::from_millis(333);

/// Head re-queries at the natural end of a sync pass.
const MAX_HEAD_REQUERIES: u32 = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// NOTICES
// ═══════════════════════════════════════════════════════════════════════════════

/// Out-of-band notices; separate from the log channel so head updates never
/// queue behind log batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceNotice {
    /// A new head header was observed.
    NewBlock(BlockHeader),
    /// First sync pass completed and the downstream channel drained.
    Synced,
}

// ═══════════════════════════════════════════════════════════════════════════════
// INGESTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for [`Ingestor`].
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Confirmation window `C` in blocks.
    pub confirmation: u64,
    /// Blocks per `getLogs` range.
    pub batch_size: u64,
    /// First block to index when the store is empty.
    pub initial_block: u64,
    /// Fetch-mode poll interval.
    pub poll_interval: Duration,
    /// Gate contract address (discovery source).
    pub gate: Address,
}

/// See the module docs.
pub struct Ingestor {
    client: Arc<dyn ChainRpc>,
    fetcher: Arc<LogFetcher>,
    subscriber: Option<Arc<LogSubscriber>>,
    writer: Arc<dyn EventWriter>,
    downstream: LogChannel,
    notices_tx: mpsc::UnboundedSender<SourceNotice>,
    config: IngestorConfig,
    synced: AtomicBool,
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("config", &self.config)
            .field("synced", &self.synced.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Task-local ingestion state; owned by [`Ingestor::run`].
#[derive(Debug, Default)]
struct SourceState {
    head: u64,
    confirming: BTreeMap<LogPosition, ChainLog>,
    pending: BTreeMap<LogPosition, ChainLog>,
}

impl Ingestor {
    /// Create an ingestor. `subscriber` absent means fetch mode.
    #[must_use]
    pub fn new(
        client: Arc<dyn ChainRpc>,
        fetcher: Arc<LogFetcher>,
        subscriber: Option<Arc<LogSubscriber>>,
        writer: Arc<dyn EventWriter>,
        downstream: LogChannel,
        config: IngestorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SourceNotice>) {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                fetcher,
                subscriber,
                writer,
                downstream,
                notices_tx,
                config,
                synced: AtomicBool::new(false),
            },
            notices_rx,
        )
    }

    /// Drive ingestion until shutdown.
    ///
    /// In subscribe mode, `events_rx` carries the WebSocket session events;
    /// every (re)connect triggers a full sync. In fetch mode the sync loop
    /// runs on the poll timer.
    ///
    /// # Errors
    ///
    /// Returns an error when the downstream channel closes.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        events_rx: Option<mpsc::UnboundedReceiver<SubscriberEvent>>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut state = SourceState::default();

        match events_rx {
            Some(mut rx) => loop {
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),

                    event = rx.recv() => {
                        let Some(event) = event else { return Ok(()) };
                        self.handle_subscriber_event(&mut state, &mut rx, event, &shutdown)
                            .await?;
                    }
                }
            },
            None => loop {
                if let Err(e) = self.sync(&mut state, None, &shutdown).await {
                    if matches!(e, AppError::ShutdownRequested) {
                        return Ok(());
                    }
                    // The pass stops here; the next timer tick retries.
                    warn!(error = %e, "Sync pass failed");
                }
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            },
        }
    }

    async fn handle_subscriber_event(
        &self,
        state: &mut SourceState,
        rx: &mut mpsc::UnboundedReceiver<SubscriberEvent>,
        event: SubscriberEvent,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        match event {
            SubscriberEvent::Connected => {
                info!("Subscriber connected, starting sync");
                if let Err(e) = self.sync(state, Some(rx), shutdown).await {
                    if matches!(e, AppError::ShutdownRequested) {
                        return Err(e);
                    }
                    warn!(error = %e, "Sync pass failed");
                }
            }
            SubscriberEvent::Loss => {
                // The reconnect emits Connected, which resyncs.
                warn!("Subscriber connection lost");
            }
            SubscriberEvent::Log(log) => self.on_live_log(state, log).await?,
            SubscriberEvent::Removed(position) => Self::on_removed(state, position),
            SubscriberEvent::NewHead(header) => self.on_new_head(state, header).await?,
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Steady state
    // ───────────────────────────────────────────────────────────────────────────

    /// A subscription log outside a sync pass.
    async fn on_live_log(&self, state: &mut SourceState, log: ChainLog) -> Result<()> {
        let head = state.head;
        if let Some(instrument) = self.discovery_address(&log) {
            if self.register_instrument(instrument) {
                // Catch the new market up over the discovery block; its logs
                // arrive through the subscription from here on.
                let extra = self
                    .refetch_instrument(instrument, log.block_number, log.block_number)
                    .await;
                for log in extra {
                    self.stage_log(state, log, head).await?;
                }
            }
        }
        self.stage_log(state, log, head).await
    }

    /// A `removed=true` notification: de-queue the matching unconfirmed log.
    fn on_removed(state: &mut SourceState, position: LogPosition) {
        if state.confirming.remove(&position).is_none()
            && state.pending.remove(&position).is_none()
        {
            warn!(%position, "Removal for unknown log, discarding");
        }
    }

    /// Serial head processor: update the head, promote confirmed logs in
    /// position order, emit the new-block notice.
    async fn on_new_head(&self, state: &mut SourceState, header: BlockHeader) -> Result<()> {
        if header.number > state.head {
            state.head = header.number;
        }
        let boundary = state.head.saturating_sub(self.config.confirmation);

        // Everything at or below the boundary leaves the confirming queue.
        let keep = state
            .confirming
            .split_off(&LogPosition::block_start(boundary + 1));
        let promoted = std::mem::replace(&mut state.confirming, keep);
        if !promoted.is_empty() {
            let batch: Vec<ChainLog> = promoted.into_values().collect();
            debug!(count = batch.len(), boundary, "Promoting confirmed logs");
            self.downstream.send(batch).await?;
        }

        let _ = self.notices_tx.send(SourceNotice::NewBlock(header));
        Ok(())
    }

    /// Route one log through the confirmation split at `target - C`.
    async fn stage_log(&self, state: &mut SourceState, log: ChainLog, target: u64) -> Result<()> {
        let boundary = target.saturating_sub(self.config.confirmation);
        if log.block_number > boundary {
            state.confirming.insert(log.position(), log);
        } else {
            self.downstream.send(vec![log]).await?;
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Sync loop
    // ───────────────────────────────────────────────────────────────────────────

    #[instrument(skip_all)]
    async fn sync(
        &self,
        state: &mut SourceState,
        mut rx: Option<&mut mpsc::UnboundedReceiver<SubscriberEvent>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut target = self.client.block_number().await?;
        state.head = state.head.max(target);

        // Logs the subscription delivered below the target are re-fetched
        // authoritatively by the range scan.
        state.pending.retain(|p, _| p.block_number >= target);

        let stored = self.writer.stored_block().await?.unwrap_or(0);
        let mut current = stored.max(self.config.initial_block);
        let mut requeries = 0u32;
        info!(current, target, "Sync pass starting");

        while current <= target {
            if shutdown.is_cancelled() {
                return Err(AppError::ShutdownRequested);
            }
            if let Some(rx) = rx.as_mut() {
                self.drain_subscriber(state, rx, target);
            }

            let end = (current + self.config.batch_size).min(target);
            let mut logs = self.fetcher.fetch(current, end).await?;
            logs.sort_by_key(ChainLog::position);

            let discovered: Vec<Address> = logs
                .iter()
                .filter_map(|log| self.discovery_address(log))
                .filter(|address| self.register_instrument(*address))
                .collect();

            if !discovered.is_empty() {
                for instrument in &discovered {
                    let extra = self.refetch_instrument(*instrument, current, end).await;
                    logs.extend(extra);
                }
                logs.sort_by_key(ChainLog::position);
                logs.dedup_by_key(|log| log.position());
                // New markets may already be emitting past `end`.
                target = self.client.block_number().await?;
                state.head = state.head.max(target);
            }

            self.emit_batch(state, logs, target).await?;
            current = end + 1;

            if current > target {
                // Natural termination: future pending logs extend the pass,
                // else the head is re-queried a bounded number of times.
                if let Some(future) = state
                    .pending
                    .keys()
                    .map(|p| p.block_number)
                    .find(|b| *b > target)
                {
                    target = future;
                    state.head = state.head.max(target);
                    continue;
                }
                let head = self.client.block_number().await?;
                if head != target && requeries < MAX_HEAD_REQUERIES {
                    target = head;
                    state.head = state.head.max(target);
                    requeries += 1;
                }
            }
        }

        // Flush subscription logs gathered during the pass, in order.
        let pending = std::mem::take(&mut state.pending);
        let flush: Vec<ChainLog> = pending.into_values().collect();
        let boundary_target = state.head.max(target);
        self.emit_batch(state, flush, boundary_target).await?;

        info!(target, "Sync pass complete");
        self.notify_synced_once();
        Ok(())
    }

    /// Split a sorted batch at `target - C`: confirmed logs go downstream as
    /// one batch, the rest wait in the confirming queue.
    async fn emit_batch(
        &self,
        state: &mut SourceState,
        logs: Vec<ChainLog>,
        target: u64,
    ) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let boundary = target.saturating_sub(self.config.confirmation);
        let mut confirmed = Vec::with_capacity(logs.len());
        for log in logs {
            if log.block_number > boundary {
                state.confirming.insert(log.position(), log);
            } else {
                confirmed.push(log);
            }
        }
        self.downstream.send(confirmed).await
    }

    /// Non-blocking drain of subscriber events during a sync pass. Logs go
    /// to the pending queue (the fetch is authoritative below `target`),
    /// heads advance the head watermark.
    fn drain_subscriber(
        &self,
        state: &mut SourceState,
        rx: &mut mpsc::UnboundedReceiver<SubscriberEvent>,
        target: u64,
    ) {
        while let Ok(event) = rx.try_recv() {
            match event {
                SubscriberEvent::Log(log) => {
                    if log.block_number >= target {
                        state.pending.insert(log.position(), log);
                    }
                }
                SubscriberEvent::Removed(position) => Self::on_removed(state, position),
                SubscriberEvent::NewHead(header) => {
                    state.head = state.head.max(header.number);
                    let _ = self.notices_tx.send(SourceNotice::NewBlock(header));
                }
                SubscriberEvent::Connected | SubscriberEvent::Loss => {}
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Discovery
    // ───────────────────────────────────────────────────────────────────────────

    /// The instrument address if this is a Gate `NewInstrument` log.
    fn discovery_address(&self, log: &ChainLog) -> Option<Address> {
        if log.address != self.config.gate {
            return None;
        }
        match ProtocolEvent::decode(ContractKind::Gate, &log.to_primitive()) {
            Ok(Some(ProtocolEvent::NewInstrument(e))) => Some(e.instrument),
            Ok(_) => None,
            Err(e) => {
                warn!(position = %log.position(), error = %e, "Gate log decode failed");
                None
            }
        }
    }

    /// Register a discovered market with the fetcher and (when live) the
    /// subscriber. Returns false when it was already known.
    fn register_instrument(&self, instrument: Address) -> bool {
        let subscription = LogSubscription {
            address: instrument,
            topics: vec![],
        };
        let fresh = self.fetcher.register(subscription.clone());
        if fresh {
            info!(address = %instrument, "Instrument discovered");
            if let Some(subscriber) = &self.subscriber {
                subscriber.register(subscription);
            }
        }
        fresh
    }

    /// Re-fetch a range for one instrument alone, retrying while the node
    /// returns nothing (freshly created markets lag on some nodes).
    async fn refetch_instrument(&self, instrument: Address, from: u64, to: u64) -> Vec<ChainLog> {
        let subscription = [LogSubscription {
            address: instrument,
            topics: vec![],
        }];
        for attempt in 0..DISCOVERY_RETRIES {
            match self.fetcher.fetch_for(&subscription, from, to).await {
                Ok(logs) if !logs.is_empty() => return logs,
                Ok(_) => {}
                Err(e) => {
                    warn!(address = %instrument, error = %e, "Instrument re-fetch failed");
                    return Vec::new();
                }
            }
            if attempt + 1 < DISCOVERY_RETRIES {
                tokio::time::sleep(DISCOVERY_RETRY_GAP).await;
            }
        }
        warn!(address = %instrument, from, to, "Instrument re-fetch stayed empty, skipping");
        Vec::new()
    }

    /// Emit `synced` exactly once, after the downstream channel drains.
    fn notify_synced_once(&self) {
        if self.synced.swap(true, Ordering::SeqCst) {
            return;
        }
        let downstream = self.downstream.clone();
        let notices_tx = self.notices_tx.clone();
        tokio::spawn(async move {
            downstream.drained().await;
            info!("Source synced");
            let _ = notices_tx.send(SourceNotice::Synced);
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::primitives::{B256, Bytes, U256};
    use alloy::sol_types::SolEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::abi::gate;
    use crate::error::Result as AppResult;
    use crate::ingest::channel::{LogReceiver, log_channel};
    use crate::ports::WriteBatch;
    use crate::types::StoredEvent;

    use super::*;

    const GATE: Address = Address::repeat_byte(0x0A);
    const INSTRUMENT: Address = Address::repeat_byte(0x14);

    fn plain_log(address: Address, block: u64, log_index: u64) -> ChainLog {
        ChainLog {
            chain_id: 1,
            address,
            block_number: block,
            block_hash: B256::repeat_byte(0x30),
            tx_hash: B256::repeat_byte(0x40),
            transaction_index: 0,
            log_index,
            topics: vec![B256::repeat_byte(0x50)],
            data: Bytes::new(),
            removed: false,
        }
    }

    fn discovery_log(block: u64) -> ChainLog {
        let event = gate::NewInstrument {
            instrument: INSTRUMENT,
            index: B256::repeat_byte(0x01),
            symbol: "ETH-USDB-PERP".into(),
        };
        let mut log = plain_log(GATE, block, 0);
        log.topics = event.encode_topics().into_iter().map(|t| t.0).collect();
        log.data = event.encode_data().into();
        log
    }

    /// Scripted chain: per-address logs plus a head sequence.
    #[derive(Default)]
    struct ScriptedRpc {
        logs: Mutex<Vec<ChainLog>>,
        heads: Mutex<Vec<u64>>,
        last_head: Mutex<u64>,
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

        async fn get_block(&self, _number: u64) -> AppResult<Option<BlockHeader>> {
            Ok(None)
        }

        async fn block_number(&self) -> AppResult<u64> {
            let mut heads = self.heads.lock();
            let head = if heads.is_empty() {
                *self.last_head.lock()
            } else {
                heads.remove(0)
            };
            *self.last_head.lock() = head;
            Ok(head)
        }
    }

    /// Writer stub: the source only reads the stored-block cursor.
    #[derive(Debug, Default)]
    struct NullWriter;

    #[async_trait]
    impl EventWriter for NullWriter {
        async fn find_by_id(&self, _id: B256, _block: u64) -> AppResult<Option<StoredEvent>> {
            Ok(None)
        }
        async fn write_batch(&self, _batch: WriteBatch) -> AppResult<()> {
            Ok(())
        }
        async fn stored_block(&self) -> AppResult<Option<u64>> {
            Ok(None)
        }
        async fn stored_after(
            &self,
            _after: Option<LogPosition>,
            _limit: usize,
        ) -> AppResult<Vec<StoredEvent>> {
            Ok(vec![])
        }
    }

    struct Rig {
        ingestor: Ingestor,
        rx: LogReceiver,
        notices: mpsc::UnboundedReceiver<SourceNotice>,
        rpc: Arc<ScriptedRpc>,
    }

    fn rig(confirmation: u64, threshold: usize) -> Rig {
        let rpc = Arc::new(ScriptedRpc::default());
        let fetcher = Arc::new(LogFetcher::new(Arc::clone(&rpc) as Arc<dyn ChainRpc>));
        fetcher.register(LogSubscription {
            address: GATE,
            topics: vec![],
        });
        let (tx, rx) = log_channel(threshold);
        let (ingestor, notices) = Ingestor::new(
            Arc::clone(&rpc) as Arc<dyn ChainRpc>,
            fetcher,
            None,
            Arc::new(NullWriter),
            tx,
            IngestorConfig {
                confirmation,
                batch_size: 1000,
                initial_block: 0,
                poll_interval: Duration::from_secs(3),
                gate: GATE,
            },
        );
        Rig {
            ingestor,
            rx,
            notices,
            rpc,
        }
    }

    async fn drain_blocks(rx: &mut LogReceiver) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(Some(batch)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            out.extend(batch.iter().map(|l| l.block_number));
        }
        out
    }

    #[tokio::test]
    async fn sync_splits_at_confirmation_boundary() {
        let mut rig = rig(2, 100_000);
        {
            let mut logs = rig.rpc.logs.lock();
            for block in [100, 101, 102, 103] {
                logs.push(plain_log(GATE, block, 1));
            }
        }
        *rig.rpc.last_head.lock() = 103;

        let mut state = SourceState::default();
        rig.ingestor
            .sync(&mut state, None, &CancellationToken::new())
            .await
            .unwrap();

        // head 103, C=2: blocks ≤ 101 are confirmed, 102..=103 confirming.
        assert_eq!(drain_blocks(&mut rig.rx).await, vec![100, 101]);
        assert_eq!(state.confirming.len(), 2);
    }

    #[tokio::test]
    async fn new_head_promotes_in_position_order() {
        let mut rig = rig(2, 100_000);
        let mut state = SourceState::default();
        state.head = 103;
        for (block, log_index) in [(102, 5), (102, 1), (103, 0)] {
            let log = plain_log(GATE, block, log_index);
            state.confirming.insert(log.position(), log);
        }

        rig.ingestor
            .on_new_head(
                &mut state,
                BlockHeader {
                    number: 104,
                    hash: B256::repeat_byte(1),
                    parent_hash: B256::repeat_byte(2),
                    timestamp: 0,
                },
            )
            .await
            .unwrap();

        // Boundary 102: both block-102 logs leave, ordered by log index.
        let batch = rig.rx.recv().await.unwrap();
        let released: Vec<(u64, u64)> =
            batch.iter().map(|l| (l.block_number, l.log_index)).collect();
        assert_eq!(released, vec![(102, 1), (102, 5)]);
        assert_eq!(state.confirming.len(), 1);

        match rig.notices.try_recv().unwrap() {
            SourceNotice::NewBlock(header) => assert_eq!(header.number, 104),
            other => panic!("expected NewBlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discovery_merges_instrument_logs_sorted() {
        let mut rig = rig(2, 100_000);
        {
            let mut logs = rig.rpc.logs.lock();
            logs.push(discovery_log(10));
            // Instrument logs in the same range, unknown before discovery.
            logs.push(plain_log(INSTRUMENT, 11, 0));
            logs.push(plain_log(INSTRUMENT, 10, 3));
            logs.push(plain_log(GATE, 12, 0));
        }
        *rig.rpc.last_head.lock() = 50;

        let mut state = SourceState::default();
        rig.ingestor
            .sync(&mut state, None, &CancellationToken::new())
            .await
            .unwrap();

        // Merged and position-sorted before emission.
        assert_eq!(drain_blocks(&mut rig.rx).await, vec![10, 10, 11, 12]);
        assert!(rig.ingestor.fetcher.is_registered(INSTRUMENT));
    }

    #[tokio::test]
    async fn removed_log_dequeues_confirming() {
        let mut state = SourceState::default();
        let log = plain_log(GATE, 100, 3);
        let position = log.position();
        state.confirming.insert(position, log);

        Ingestor::on_removed(&mut state, position);
        assert!(state.confirming.is_empty());

        // Unknown removal: warned and discarded, no panic.
        Ingestor::on_removed(&mut state, LogPosition::new(999, 0, 0));
    }

    #[tokio::test]
    async fn backpressure_suspends_sync_until_drain() {
        let rig = rig(0, 10);
        {
            let mut logs = rig.rpc.logs.lock();
            for block in 0..25u64 {
                logs.push(plain_log(GATE, block, 0));
            }
        }
        *rig.rpc.last_head.lock() = 24;

        let Rig {
            ingestor,
            mut rx,
            notices,
            rpc: _,
        } = rig;
        let handle = tokio::spawn(async move {
            let mut state = SourceState::default();
            ingestor
                .sync(&mut state, None, &CancellationToken::new())
                .await
                .unwrap();
            notices
        });

        // The sync suspends on the threshold with a slow consumer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        // Draining resumes it.
        let blocks = drain_blocks(&mut rx).await;
        assert_eq!(blocks.len(), 25);
        let mut notices = handle.await.unwrap();

        // Synced fires once the channel is empty.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut saw_synced = false;
        while let Ok(notice) = notices.try_recv() {
            if notice == SourceNotice::Synced {
                saw_synced = true;
            }
        }
        assert!(saw_synced);
    }
}
