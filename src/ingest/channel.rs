//! Downstream log channel with depth-based backpressure.
//!
//! Confirmed log batches flow from the ingestor to the storage processor
//! through this channel. The sender tracks the total number of in-flight
//! logs; once the depth reaches the threshold, `send` suspends on a one-shot
//! awake signal until the consumer drains below it. The block-number notice
//! channel is separate, so head updates never queue behind log batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::error::{InfraError, Result};
use crate::types::ChainLog;

/// Create a log channel suspending senders at `threshold` in-flight logs.
#[must_use]
pub fn log_channel(threshold: usize) -> (LogChannel, LogReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let awake = Arc::new(Notify::new());
    (
        LogChannel {
            tx,
            depth: Arc::clone(&depth),
            awake: Arc::clone(&awake),
            threshold: threshold.max(1),
        },
        LogReceiver { rx, depth, awake },
    )
}

/// Sending half; cheap to clone.
#[derive(Debug, Clone)]
pub struct LogChannel {
    tx: mpsc::UnboundedSender<Vec<ChainLog>>,
    depth: Arc<AtomicUsize>,
    awake: Arc<Notify>,
    threshold: usize,
}

impl LogChannel {
    /// Send a batch; suspends while the channel depth is at or above the
    /// threshold.
    ///
    /// # Errors
    ///
    /// Returns an error when the receiver is gone.
    pub async fn send(&self, batch: Vec<ChainLog>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.depth.fetch_add(batch.len(), Ordering::SeqCst);
        self.tx
            .send(batch)
            .map_err(|_| InfraError::ChannelClosed("downstream logs".into()))?;

        loop {
            if self.depth.load(Ordering::SeqCst) < self.threshold {
                return Ok(());
            }
            let notified = self.awake.notified();
            if self.depth.load(Ordering::SeqCst) < self.threshold {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Current in-flight log count.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Resolve once every in-flight log has been consumed.
    pub async fn drained(&self) {
        loop {
            if self.depth.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.awake.notified();
            if self.depth.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Receiving half, held by the storage processor.
#[derive(Debug)]
pub struct LogReceiver {
    rx: mpsc::UnboundedReceiver<Vec<ChainLog>>,
    depth: Arc<AtomicUsize>,
    awake: Arc<Notify>,
}

impl LogReceiver {
    /// Receive the next batch; `None` when all senders are gone.
    pub async fn recv(&mut self) -> Option<Vec<ChainLog>> {
        let batch = self.rx.recv().await?;
        self.depth.fetch_sub(batch.len(), Ordering::SeqCst);
        self.awake.notify_waiters();
        Some(batch)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256, Bytes};

    use super::*;

    fn logs(count: usize, block: u64) -> Vec<ChainLog> {
        (0..count)
            .map(|i| ChainLog {
                chain_id: 1,
                address: Address::ZERO,
                block_number: block,
                block_hash: B256::ZERO,
                tx_hash: B256::ZERO,
                transaction_index: 0,
                log_index: i as u64,
                topics: vec![],
                data: Bytes::new(),
                removed: false,
            })
            .collect()
    }

    #[tokio::test]
    async fn sender_suspends_at_threshold_and_resumes_on_drain() {
        let (tx, mut rx) = log_channel(10);

        // First batch reaches the threshold exactly: send suspends.
        let sender = {
            let tx = tx.clone();
            tokio::spawn(async move {
                tx.send(logs(10, 1)).await.unwrap();
                tx.send(logs(3, 2)).await.unwrap();
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!sender.is_finished());
        assert_eq!(tx.depth(), 10);

        // One consumer drain cycle resumes the sender.
        assert_eq!(rx.recv().await.unwrap().len(), 10);
        sender.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 3);
        assert_eq!(tx.depth(), 0);
    }

    #[tokio::test]
    async fn drained_resolves_after_consumption() {
        let (tx, mut rx) = log_channel(100);
        tx.send(logs(5, 1)).await.unwrap();

        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.drained().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        rx.recv().await.unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn empty_batches_are_dropped() {
        let (tx, _rx) = log_channel(10);
        tx.send(vec![]).await.unwrap();
        assert_eq!(tx.depth(), 0);
    }
}
