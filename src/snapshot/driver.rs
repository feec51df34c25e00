//! Live snapshot maintenance, persistence, and reorg recovery.
//!
//! The driver owns the in-memory [`Snapshot`] at the latest applied position.
//! A serial worker task consumes parsed-event messages from the storage
//! processor and control messages (reorg) from the reorg detector and the
//! request handler:
//!
//! - Every parsed event is applied to the live snapshot; the live position
//!   advances when events arrive in order.
//! - An out-of-order event is still applied (application is
//!   position-insensitive by contract) but invalidates stored snapshots at or
//!   above its block; the live position is deliberately not rewound.
//! - Every `interval` blocks the live state is persisted and outdated
//!   snapshots are pruned (always keeping the newest row), in one
//!   transaction.
//! - A reorg clears the live state, deletes stored snapshots at or above the
//!   divergence block, regenerates up to the preceding block, and only then
//!   resolves the caller. While pending, readers observe the `reorging`
//!   sentinel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abi::ProtocolEvent;
use crate::error::{AppError, DomainError, Result};
use crate::ports::SnapshotBackend;
use crate::types::{LogPosition, StoredEvent};

use super::state::Snapshot;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Events per replay batch.
const REPLAY_LIMIT: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED REPLAY
// ═══════════════════════════════════════════════════════════════════════════════

/// Materialize a snapshot at `to` by replaying stored events.
///
/// Without an explicit `from` base, replay starts from the stored snapshot
/// nearest at-or-before `to` (or from genesis). The cancellation signal is
/// honored between batches.
///
/// Returns the snapshot and the latest applied position.
///
/// # Errors
///
/// Returns [`AppError::Cancelled`] when `signal` fires, or a storage error.
pub async fn generate(
    backend: &dyn SnapshotBackend,
    to: LogPosition,
    from: Option<(Snapshot, LogPosition)>,
    signal: Option<&CancellationToken>,
) -> Result<(Snapshot, LogPosition)> {
    let (mut snapshot, mut position, mut after) = match from {
        Some((snapshot, position)) => (snapshot, position, Some(position)),
        None => match backend.nearest_snapshot(to).await? {
            Some((position, value)) => (Snapshot::from_value(value)?, position, Some(position)),
            None => (Snapshot::default(), LogPosition::default(), None),
        },
    };

    loop {
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(AppError::Cancelled);
        }

        let batch = backend.next_batch(after, Some(to), REPLAY_LIMIT).await?;
        let Some(last) = batch.last() else {
            break;
        };
        after = Some(last.position());
        position = last.position();

        for event in &batch {
            match ProtocolEvent::from_payload(event.payload.clone()) {
                Ok(parsed) => snapshot.apply(&event.log, &parsed),
                // A payload that no longer decodes is skipped, same as a
                // parse failure on the way in.
                Err(e) => warn!(position = %event.position(), error = %e, "Skipping stored event"),
            }
        }
    }

    Ok((snapshot, position))
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIVE STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Externally observable snapshot status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// No live snapshot yet.
    Unavailable,
    /// A reorg regeneration is pending.
    Reorging,
    /// Live at this position.
    Ready(LogPosition),
}

enum Live {
    Unavailable,
    Reorging,
    Ready {
        snapshot: Snapshot,
        position: LogPosition,
    },
}

enum DriverMsg {
    Parsed {
        event: StoredEvent,
        parsed: ProtocolEvent,
    },
    Reorg {
        block: u64,
        done: oneshot::Sender<Result<()>>,
    },
}

impl std::fmt::Debug for DriverMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parsed { event, .. } => {
                f.debug_tuple("Parsed").field(&event.position()).finish()
            }
            Self::Reorg { block, .. } => f.debug_tuple("Reorg").field(block).finish(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner of the live snapshot; see the module docs.
pub struct SnapshotDriver {
    backend: Arc<dyn SnapshotBackend>,
    interval: u64,
    outdated: u64,
    live: parking_lot::RwLock<Live>,
    msg_tx: mpsc::UnboundedSender<DriverMsg>,
    msg_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DriverMsg>>>,
}

impl std::fmt::Debug for SnapshotDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotDriver")
            .field("interval", &self.interval)
            .field("outdated", &self.outdated)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SnapshotDriver {
    /// Create a driver persisting every `interval` blocks and pruning
    /// snapshots older than `outdated` blocks.
    #[must_use]
    pub fn new(backend: Arc<dyn SnapshotBackend>, interval: u64, outdated: u64) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            interval: interval.max(1),
            outdated,
            live: parking_lot::RwLock::new(Live::Unavailable),
            msg_tx,
            msg_rx: parking_lot::Mutex::new(Some(msg_rx)),
        }
    }

    /// Feed one parsed event (storage-processor hook).
    pub fn on_parsed(&self, event: StoredEvent, parsed: ProtocolEvent) {
        let _ = self.msg_tx.send(DriverMsg::Parsed { event, parsed });
    }

    /// Request a reorg rewind; resolves once the snapshot is regenerated up
    /// to `block - 1`.
    ///
    /// # Errors
    ///
    /// Returns an error if regeneration fails or the driver stopped.
    pub async fn reorg(&self, block: u64) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.msg_tx
            .send(DriverMsg::Reorg { block, done })
            .map_err(|_| {
                crate::error::InfraError::ChannelClosed("snapshot driver".into())
            })?;
        rx.await
            .map_err(|_| crate::error::InfraError::ChannelClosed("snapshot driver".into()))?
    }

    /// Current live status.
    #[must_use]
    pub fn status(&self) -> SnapshotStatus {
        match &*self.live.read() {
            Live::Unavailable => SnapshotStatus::Unavailable,
            Live::Reorging => SnapshotStatus::Reorging,
            Live::Ready { position, .. } => SnapshotStatus::Ready(*position),
        }
    }

    /// Read the live snapshot, surfacing the `reorging` / `unavailable`
    /// domain states as errors.
    ///
    /// # Errors
    ///
    /// [`DomainError::Reorging`] while a reorg is pending,
    /// [`DomainError::Unavailable`] before initialization.
    pub fn with_live<R>(&self, f: impl FnOnce(&Snapshot, LogPosition) -> R) -> Result<R> {
        match &*self.live.read() {
            Live::Unavailable => Err(DomainError::Unavailable.into()),
            Live::Reorging => Err(DomainError::Reorging.into()),
            Live::Ready { snapshot, position } => Ok(f(snapshot, *position)),
        }
    }

    /// Run the worker until shutdown. Queued reorg messages drain before the
    /// task stops.
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        #[allow(clippy::expect_used)]
        let mut msg_rx = self
            .msg_rx
            .lock()
            .take()
            .expect("SnapshotDriver::run called twice");

        let mut last_persisted = self.on_init().await?;

        loop {
            tokio::select! {
                biased;

                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    self.handle_msg(msg, &mut last_persisted).await;
                }

                () = shutdown.cancelled() => {
                    // Pending reorg requests must resolve before stop.
                    while let Ok(msg) = msg_rx.try_recv() {
                        self.handle_msg(msg, &mut last_persisted).await;
                    }
                    info!("Snapshot driver stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Materialize the live snapshot at the latest stored block.
    async fn on_init(&self) -> Result<u64> {
        let mut last_persisted = self.backend.persisted_block().await?.unwrap_or(0);
        let to = self
            .backend
            .latest_stored_block()
            .await?
            .map_or_else(|| LogPosition::block_end(0), LogPosition::block_end);

        let (snapshot, position) = generate(self.backend.as_ref(), to, None, None).await?;
        info!(%position, "Live snapshot materialized");

        if position.block_number.saturating_sub(last_persisted) >= self.interval {
            self.persist(position, &snapshot).await;
            last_persisted = position.block_number;
        }

        *self.live.write() = Live::Ready { snapshot, position };
        Ok(last_persisted)
    }

    async fn handle_msg(&self, msg: DriverMsg, last_persisted: &mut u64) {
        match msg {
            DriverMsg::Parsed { event, parsed } => {
                self.apply_parsed(&event, &parsed, last_persisted).await;
            }
            DriverMsg::Reorg { block, done } => {
                let result = self.do_reorg(block).await;
                let _ = done.send(result);
            }
        }
    }

    async fn apply_parsed(
        &self,
        event: &StoredEvent,
        parsed: &ProtocolEvent,
        last_persisted: &mut u64,
    ) {
        let incoming = event.position();
        let mut invalidate_from: Option<u64> = None;
        let mut persist_at: Option<(LogPosition, serde_json::Value)> = None;

        {
            let mut live = self.live.write();
            let Live::Ready { snapshot, position } = &mut *live else {
                // Events arriving before init or during a reorg rewind are
                // covered by the following regeneration.
                return;
            };

            if incoming == *position {
                // The initial replay already covered this exact position.
                return;
            }
            if incoming < *position {
                // Out-of-order: apply, invalidate stored snapshots at or
                // above this block, keep the live position where it is.
                warn!(%incoming, live = %*position, "Out-of-order event");
                snapshot.apply(&event.log, parsed);
                invalidate_from = Some(incoming.block_number);
            } else {
                snapshot.apply(&event.log, parsed);
                *position = incoming;

                if incoming.block_number.saturating_sub(*last_persisted) >= self.interval {
                    match snapshot.to_value() {
                        Ok(value) => persist_at = Some((incoming, value)),
                        Err(e) => warn!(error = %e, "Snapshot serialization failed"),
                    }
                }
            }
        }

        if let Some(block) = invalidate_from {
            match self.backend.destroy_snapshots_from(block).await {
                Ok(deleted) if deleted > 0 => {
                    debug!(block, deleted, "Invalidated stored snapshots");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to invalidate stored snapshots"),
            }
        }

        if let Some((position, value)) = persist_at {
            let prune_before = position.block_number.saturating_sub(self.outdated);
            match self
                .backend
                .persist_checkpoint(position, value, prune_before)
                .await
            {
                Ok(()) => {
                    *last_persisted = position.block_number;
                    debug!(%position, "Snapshot persisted");
                }
                Err(e) => warn!(error = %e, "Snapshot persistence failed"),
            }
        }
    }

    async fn persist(&self, position: LogPosition, snapshot: &Snapshot) {
        let prune_before = position.block_number.saturating_sub(self.outdated);
        match snapshot.to_value() {
            Ok(value) => {
                if let Err(e) = self
                    .backend
                    .persist_checkpoint(position, value, prune_before)
                    .await
                {
                    warn!(error = %e, "Snapshot persistence failed");
                }
            }
            Err(e) => warn!(error = %e, "Snapshot serialization failed"),
        }
    }

    /// Clear, delete invalidated rows, regenerate up to `block - 1`.
    #[instrument(skip(self))]
    async fn do_reorg(&self, block: u64) -> Result<()> {
        *self.live.write() = Live::Reorging;

        let result: Result<(Snapshot, LogPosition)> = async {
            self.backend.destroy_snapshots_from(block).await?;
            let to = LogPosition::block_end(block.saturating_sub(1));
            if block == 0 {
                return Ok((Snapshot::default(), LogPosition::default()));
            }
            generate(self.backend.as_ref(), to, None, None).await
        }
        .await;

        match result {
            Ok((snapshot, position)) => {
                info!(block, %position, "Snapshot regenerated after reorg");
                *self.live.write() = Live::Ready { snapshot, position };
                Ok(())
            }
            Err(e) => {
                warn!(block, error = %e, "Snapshot regeneration failed");
                *self.live.write() = Live::Unavailable;
                Err(e)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use alloy::primitives::{Address, B256, Bytes, I256, U256};
    use async_trait::async_trait;

    use crate::abi::instrument;
    use crate::types::ChainLog;

    use super::*;

    /// In-memory snapshot backend.
    #[derive(Debug, Default)]
    struct MemBackend {
        events: parking_lot::Mutex<Vec<StoredEvent>>,
        snapshots: parking_lot::Mutex<BTreeMap<LogPosition, serde_json::Value>>,
        persisted: parking_lot::Mutex<Option<u64>>,
    }

    #[async_trait]
    impl SnapshotBackend for MemBackend {
        async fn next_batch(
            &self,
            after: Option<LogPosition>,
            to: Option<LogPosition>,
            limit: usize,
        ) -> Result<Vec<StoredEvent>> {
            let events = self.events.lock();
            Ok(events
                .iter()
                .filter(|e| after.is_none_or(|a| e.position() > a))
                .filter(|e| to.is_none_or(|t| e.position() <= t))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn latest_stored_block(&self) -> Result<Option<u64>> {
            Ok(self.events.lock().iter().map(|e| e.log.block_number).max())
        }

        async fn nearest_snapshot(
            &self,
            position: LogPosition,
        ) -> Result<Option<(LogPosition, serde_json::Value)>> {
            Ok(self
                .snapshots
                .lock()
                .range(..=position)
                .next_back()
                .map(|(p, v)| (*p, v.clone())))
        }

        async fn destroy_snapshots_from(&self, block: u64) -> Result<u64> {
            let mut snapshots = self.snapshots.lock();
            let before = snapshots.len();
            snapshots.retain(|p, _| p.block_number < block);
            Ok((before - snapshots.len()) as u64)
        }

        async fn persist_checkpoint(
            &self,
            position: LogPosition,
            state: serde_json::Value,
            prune_before: u64,
        ) -> Result<()> {
            let mut snapshots = self.snapshots.lock();
            if let Some(newest) = snapshots.keys().next_back().copied() {
                snapshots.retain(|p, _| p.block_number > prune_before || *p == newest);
            }
            snapshots.entry(position).or_insert(state);
            *self.persisted.lock() = Some(position.block_number);
            Ok(())
        }

        async fn persisted_block(&self) -> Result<Option<u64>> {
            Ok(*self.persisted.lock())
        }
    }

    fn trade_stored(block: u64, log_index: u64, size: i64) -> StoredEvent {
        let parsed = ProtocolEvent::Trade(instrument::Trade {
            trader: Address::repeat_byte(0x77),
            expiry: u32::MAX,
            size: I256::try_from(size).unwrap(),
            amount: U256::from(100u64),
            sqrtPX96: U256::from(1u64) << 96,
            tick: 10,
            feeRatio: U256::from(30u64),
        });
        StoredEvent {
            log: ChainLog {
                chain_id: 1,
                address: Address::repeat_byte(0x14),
                block_number: block,
                block_hash: B256::repeat_byte(3),
                tx_hash: B256::repeat_byte(4),
                transaction_index: 0,
                log_index,
                topics: vec![],
                data: Bytes::new(),
                removed: false,
            },
            name: parsed.name().to_string(),
            payload: parsed.to_payload().unwrap(),
            timestamp: None,
            status: crate::types::EventStatus::default().processed(),
        }
    }

    fn parsed_of(event: &StoredEvent) -> ProtocolEvent {
        ProtocolEvent::from_payload(event.payload.clone()).unwrap()
    }

    #[tokio::test]
    async fn generate_replays_whole_range() {
        let backend = MemBackend::default();
        for block in 1..=5 {
            backend.events.lock().push(trade_stored(block, 0, 10));
        }

        let (snapshot, position) = generate(
            &backend,
            LogPosition::block_end(5),
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(position, LogPosition::new(5, 0, 0));
        let account = snapshot
            .instrument(Address::repeat_byte(0x14))
            .unwrap()
            .account(Address::repeat_byte(0x77), u32::MAX)
            .unwrap();
        assert_eq!(account.position.size, I256::try_from(50).unwrap());
    }

    #[tokio::test]
    async fn generate_is_base_independent() {
        let backend = MemBackend::default();
        for block in 1..=6 {
            backend.events.lock().push(trade_stored(block, 0, 7));
        }

        // Full replay, no base.
        let (from_genesis, _) = generate(&backend, LogPosition::block_end(6), None, None)
            .await
            .unwrap();

        // Replay with a stored snapshot at block 3 as the base.
        let (base, base_position) = generate(&backend, LogPosition::block_end(3), None, None)
            .await
            .unwrap();
        backend
            .snapshots
            .lock()
            .insert(base_position, base.to_value().unwrap());
        let (from_base, _) = generate(&backend, LogPosition::block_end(6), None, None)
            .await
            .unwrap();

        assert_eq!(
            from_genesis.to_value().unwrap(),
            from_base.to_value().unwrap()
        );
    }

    #[tokio::test]
    async fn generate_honors_cancellation() {
        let backend = MemBackend::default();
        backend.events.lock().push(trade_stored(1, 0, 1));
        let signal = CancellationToken::new();
        signal.cancel();

        let result = generate(&backend, LogPosition::block_end(1), None, Some(&signal)).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn out_of_order_event_invalidates_snapshots_without_rewind() {
        let backend = Arc::new(MemBackend::default());
        backend.events.lock().push(trade_stored(100, 0, 1));
        backend.snapshots.lock().insert(
            LogPosition::new(95, 0, 0),
            Snapshot::default().to_value().unwrap(),
        );

        let driver = Arc::new(SnapshotDriver::new(
            Arc::clone(&backend) as Arc<dyn SnapshotBackend>,
            1800,
            43200,
        ));
        let shutdown = CancellationToken::new();
        let worker = {
            let driver = Arc::clone(&driver);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { driver.run(shutdown).await })
        };

        // Wait for init.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(driver.status(), SnapshotStatus::Ready(LogPosition::new(100, 0, 0)));

        // An event below the live position.
        let stale = trade_stored(90, 0, 3);
        driver.on_parsed(stale.clone(), parsed_of(&stale));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Stored snapshots at or above block 90 are gone; position unchanged.
        assert!(backend.snapshots.lock().is_empty());
        assert_eq!(driver.status(), SnapshotStatus::Ready(LogPosition::new(100, 0, 0)));

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reorg_regenerates_below_divergence() {
        let backend = Arc::new(MemBackend::default());
        for block in 1..=10 {
            backend.events.lock().push(trade_stored(block * 100, 0, 1));
        }
        backend.snapshots.lock().insert(
            LogPosition::new(950, 0, 0),
            Snapshot::default().to_value().unwrap(),
        );

        let driver = Arc::new(SnapshotDriver::new(
            Arc::clone(&backend) as Arc<dyn SnapshotBackend>,
            1800,
            43200,
        ));
        let shutdown = CancellationToken::new();
        let worker = {
            let driver = Arc::clone(&driver);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { driver.run(shutdown).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        driver.reorg(980).await.unwrap();

        // No stored snapshot at or above 980, live position below it.
        assert!(
            backend
                .snapshots
                .lock()
                .keys()
                .all(|p| p.block_number < 980)
        );
        match driver.status() {
            SnapshotStatus::Ready(position) => {
                assert!(position <= LogPosition::block_end(979));
            }
            other => panic!("expected Ready, got {other:?}"),
        }

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_persistence_at_interval() {
        let backend = Arc::new(MemBackend::default());
        backend.events.lock().push(trade_stored(10, 0, 1));

        let driver = Arc::new(SnapshotDriver::new(
            Arc::clone(&backend) as Arc<dyn SnapshotBackend>,
            100,
            43200,
        ));
        let shutdown = CancellationToken::new();
        let worker = {
            let driver = Arc::clone(&driver);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { driver.run(shutdown).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Advancing by >= interval blocks triggers a persist.
        let event = trade_stored(150, 0, 2);
        driver.on_parsed(event.clone(), parsed_of(&event));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(*backend.persisted.lock(), Some(150));
        assert!(
            backend
                .snapshots
                .lock()
                .contains_key(&LogPosition::new(150, 0, 0))
        );

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }
}
