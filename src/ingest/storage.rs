//! Transactional consumer of confirmed log batches.
//!
//! The storage processor is the event table's only writer. It consumes
//! confirmed logs in batches of up to [`PROCESS_BATCH`], and for each log:
//!
//! 1. dedupes by synthetic id (skip if stored and already processed)
//! 2. parses against the interface selected by the emitting address
//! 3. dispatches the named handler (`NewInstrument` registers an instrument)
//! 4. inserts with the `PROCESSED` bit, or promotes an unprocessed row
//! 5. emits the parsed-event hook after the batch commits
//!
//! Each batch is one transaction; on failure the same batch retries with 1s
//! backoff until it commits or the process stops.
//!
//! [`StorageProcessor::block`] hands out an exclusive guard for the reorg
//! detector: it resolves only after any in-flight batch completes, and no
//! new batch starts while the guard is held.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abi::{ContractKind, ProtocolEvent};
use crate::error::Result;
use crate::ports::{EventWriter, WriteBatch};
use crate::types::{ChainLog, EventStatus, LogPosition, StoredEvent};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Logs per transaction.
const PROCESS_BATCH: usize = 1000;

/// Backoff between retries of a failed batch.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════════════════════
// PARSED EVENT HOOK
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload of the parsed-event hook, emitted after a batch commits.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    /// The stored event.
    pub event: StoredEvent,
    /// Decoded arguments.
    pub parsed: ProtocolEvent,
    /// Whether the event had already been processed before (reorg replay).
    pub processed: bool,
}

/// Guard released to resume processing after a reorg; see
/// [`StorageProcessor::block`].
pub type BlockGuard = tokio::sync::OwnedMutexGuard<()>;

// ═══════════════════════════════════════════════════════════════════════════════
// STORAGE PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════════

/// See the module docs.
pub struct StorageProcessor {
    writer: Arc<dyn EventWriter>,
    gate: Address,
    config: Address,
    parsed_tx: mpsc::UnboundedSender<ParsedEvent>,
    stored_block_tx: watch::Sender<u64>,
    work_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for StorageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageProcessor")
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageProcessor {
    /// Create a processor. Returns the hook receivers: parsed events and the
    /// stored-block watermark.
    #[must_use]
    pub fn new(
        writer: Arc<dyn EventWriter>,
        gate: Address,
        config: Address,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ParsedEvent>,
        watch::Receiver<u64>,
    ) {
        let (parsed_tx, parsed_rx) = mpsc::unbounded_channel();
        let (stored_block_tx, stored_block_rx) = watch::channel(0);
        (
            Self {
                writer,
                gate,
                config,
                parsed_tx,
                stored_block_tx,
                work_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
            parsed_rx,
            stored_block_rx,
        )
    }

    /// Which ABI interface an address decodes against. Anything that is not
    /// the Gate or Config contract reached us through an instrument
    /// subscription.
    fn kind_for(&self, address: Address) -> ContractKind {
        if address == self.gate {
            ContractKind::Gate
        } else if address == self.config {
            ContractKind::Config
        } else {
            ContractKind::Instrument
        }
    }

    /// Acquire the processing lock. Waits for any in-flight batch; while the
    /// guard lives, no new batch starts.
    pub async fn block(&self) -> BlockGuard {
        Arc::clone(&self.work_lock).lock_owned().await
    }

    /// Consume confirmed log batches until the channel closes or shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only for initialization failures; batch failures
    /// retry forever.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut rx: crate::ingest::channel::LogReceiver,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut latest = self.writer.stored_block().await?.unwrap_or(0);
        info!(latest, "Storage processor started");

        loop {
            tokio::select! {
                biased;

                batch = rx.recv() => {
                    let Some(batch) = batch else {
                        info!("Log channel closed, storage processor stopping");
                        return Ok(());
                    };
                    let _guard = Arc::clone(&self.work_lock).lock_owned().await;
                    for chunk in batch.chunks(PROCESS_BATCH) {
                        if self.process_chunk(chunk, &mut latest, &shutdown).await.is_err() {
                            info!("Storage processor stopped mid-batch");
                            return Ok(());
                        }
                    }
                }

                () = shutdown.cancelled() => {
                    info!("Storage processor stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Process one chunk with infinite retry; `Err` only on shutdown.
    async fn process_chunk(
        &self,
        logs: &[ChainLog],
        latest: &mut u64,
        shutdown: &CancellationToken,
    ) -> std::result::Result<(), ()> {
        loop {
            match self.process_logs(logs, false).await {
                Ok(chunk_latest) => {
                    if let Some(block) = chunk_latest {
                        if block > *latest {
                            *latest = block;
                            let _ = self.stored_block_tx.send(block);
                        }
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, logs = logs.len(), "Batch failed, retrying");
                    tokio::select! {
                        () = shutdown.cancelled() => return Err(()),
                        () = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// One transactional pass over `logs`. Returns the highest block written
    /// (None when nothing was written).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; the caller retries.
    pub async fn process_logs(
        &self,
        logs: &[ChainLog],
        reprocessing: bool,
    ) -> Result<Option<u64>> {
        let mut batch = WriteBatch::default();
        let mut hooks: Vec<ParsedEvent> = Vec::new();
        let mut chunk_latest: Option<u64> = None;

        for log in logs {
            let id = log.id();
            let existing = self.writer.find_by_id(id, log.block_number).await?;

            if let Some(existing) = &existing {
                if existing.status.is_processed() && !reprocessing {
                    continue;
                }
            }

            let kind = self.kind_for(log.address);
            let parsed = match ProtocolEvent::decode(kind, &log.to_primitive()) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => {
                    debug!(address = %log.address, "Unrecognized event, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(position = %log.position(), error = %e, "Parse failed, skipping");
                    continue;
                }
            };

            let was_processed = existing
                .as_ref()
                .is_some_and(|e| e.status.is_processed());
            self.dispatch(&mut batch, log, &parsed);

            let stored = match existing {
                None => {
                    let stored = StoredEvent {
                        log: log.clone(),
                        name: parsed.name().to_string(),
                        payload: parsed.to_payload()?,
                        timestamp: None,
                        status: EventStatus::default().processed(),
                    };
                    batch.creates.push(stored.clone());
                    stored
                }
                Some(mut stored) => {
                    if !stored.status.is_processed() {
                        stored.status = stored.status.processed();
                        batch.set_processed.push(stored.clone());
                    }
                    stored
                }
            };

            chunk_latest = Some(chunk_latest.map_or(log.block_number, |l| l.max(log.block_number)));
            hooks.push(ParsedEvent {
                event: stored,
                parsed,
                processed: was_processed,
            });
        }

        batch.latest_block = chunk_latest;
        if !batch.is_empty() {
            self.writer.write_batch(batch).await?;
        }

        for hook in hooks {
            let _ = self.parsed_tx.send(hook);
        }
        Ok(chunk_latest)
    }

    /// Static dispatch table for named handlers. `NewInstrument` is the only
    /// built-in: it registers the discovered market.
    fn dispatch(&self, batch: &mut WriteBatch, log: &ChainLog, parsed: &ProtocolEvent) {
        if let ProtocolEvent::NewInstrument(e) = parsed {
            batch
                .instruments
                .push((e.instrument, e.symbol.clone(), log.block_number));
        }
    }

    /// Re-process stored events with `position > (from_block - 1, ∞, ∞)` in
    /// order, with pre-parsed arguments and existence checks bypassed.
    ///
    /// The caller holds the [`BlockGuard`] while this runs.
    ///
    /// # Errors
    ///
    /// Returns an error if storage reads or writes fail.
    #[instrument(skip(self))]
    pub async fn reorg(&self, from_block: u64) -> Result<()> {
        let mut after = Some(LogPosition::block_end(from_block.saturating_sub(1)));
        if from_block == 0 {
            after = None;
        }
        let mut replayed = 0usize;

        loop {
            let batch = self.writer.stored_after(after, PROCESS_BATCH).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.position());

            let mut writes = WriteBatch::default();
            let mut hooks = Vec::with_capacity(batch.len());
            for event in batch {
                let parsed = match ProtocolEvent::from_payload(event.payload.clone()) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(position = %event.position(), error = %e, "Skipping stored event");
                        continue;
                    }
                };
                self.dispatch(&mut writes, &event.log, &parsed);
                hooks.push(ParsedEvent {
                    event,
                    parsed,
                    processed: true,
                });
            }

            // Handler effects (instrument rows) are idempotent upserts.
            writes.latest_block = None;
            if !writes.is_empty() {
                self.writer.write_batch(writes).await?;
            }
            replayed += hooks.len();
            for hook in hooks {
                let _ = self.parsed_tx.send(hook);
            }
        }

        info!(from_block, replayed, "Reorg reprocessing complete");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
