//! Parallel-bounded `getLogs` over a set of subscriptions.
//!
//! The fetcher holds an append-only list of `(address, topics)` subscriptions
//! and fans a block range out to one `getLogs` call per subscription, at most
//! `parallel` in flight. Results are concatenated without ordering guarantees;
//! callers sort by position.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::types::ChainLog;

use super::client::ChainRpc;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Default concurrent `getLogs` calls per fetch.
const DEFAULT_PARALLEL: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// SUBSCRIPTION
// ═══════════════════════════════════════════════════════════════════════════════

/// One `(address, topics)` log subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSubscription {
    /// Emitting contract address.
    pub address: Address,
    /// topic0 signatures to narrow to; empty = all events from the address.
    pub topics: Vec<B256>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOG FETCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Fan-out `getLogs` fetcher over registered subscriptions.
pub struct LogFetcher {
    client: Arc<dyn ChainRpc>,
    subscriptions: RwLock<Vec<LogSubscription>>,
    parallel: usize,
}

impl std::fmt::Debug for LogFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFetcher")
            .field("subscriptions", &self.subscriptions.read().len())
            .field("parallel", &self.parallel)
            .finish_non_exhaustive()
    }
}

impl LogFetcher {
    /// Create a fetcher with the default parallelism.
    #[must_use]
    pub fn new(client: Arc<dyn ChainRpc>) -> Self {
        Self::with_parallel(client, DEFAULT_PARALLEL)
    }

    /// Create a fetcher with explicit parallelism.
    #[must_use]
    pub fn with_parallel(client: Arc<dyn ChainRpc>, parallel: usize) -> Self {
        Self {
            client,
            subscriptions: RwLock::new(Vec::new()),
            parallel: parallel.max(1),
        }
    }

    /// Register a subscription. Subscriptions are append-only; duplicates by
    /// address are ignored.
    pub fn register(&self, subscription: LogSubscription) -> bool {
        let mut subs = self.subscriptions.write();
        if subs.iter().any(|s| s.address == subscription.address) {
            return false;
        }
        debug!(address = %subscription.address, "Registered log subscription");
        subs.push(subscription);
        true
    }

    /// Whether an address is already subscribed.
    #[must_use]
    pub fn is_registered(&self, address: Address) -> bool {
        self.subscriptions.read().iter().any(|s| s.address == address)
    }

    /// Currently registered subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<LogSubscription> {
        self.subscriptions.read().clone()
    }

    /// Fetch `[from, to]` for every subscription, ≤ `parallel` in flight.
    ///
    /// Result ordering is unspecified - sort by position before use.
    ///
    /// # Errors
    ///
    /// Propagates the first unrecoverable adapter error.
    #[instrument(skip(self), fields(subs = self.subscriptions.read().len()))]
    pub async fn fetch(&self, from: u64, to: u64) -> Result<Vec<ChainLog>> {
        let subs = self.subscriptions();
        self.fetch_for(&subs, from, to).await
    }

    /// Fetch `[from, to]` for one explicit subscription set (used for
    /// single-instrument catch-up after discovery).
    ///
    /// # Errors
    ///
    /// Propagates the first unrecoverable adapter error.
    pub async fn fetch_for(
        &self,
        subscriptions: &[LogSubscription],
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainLog>> {
        let client = &self.client;
        let batches: Vec<Vec<ChainLog>> = stream::iter(subscriptions.iter().cloned())
            .map(|sub| async move {
                client
                    .get_logs(from, to, sub.address, &sub.topics)
                    .await
            })
            .buffer_unordered(self.parallel)
            .try_collect()
            .await?;

        Ok(batches.into_iter().flatten().collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy::primitives::Bytes;
    use async_trait::async_trait;

    use crate::chain::client::BlockHeader;

    use super::*;

    /// Returns one log per queried address and tracks peak concurrency.
    struct FanOutRpc {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChainRpc for FanOutRpc {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn get_logs(
            &self,
            from: u64,
            _to: u64,
            address: Address,
            _topics: &[B256],
        ) -> Result<Vec<ChainLog>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(vec![ChainLog {
                chain_id: 1,
                address,
                block_number: from,
                block_hash: B256::repeat_byte(1),
                tx_hash: B256::repeat_byte(2),
                transaction_index: 0,
                log_index: u64::from(address.as_slice()[19]),
                topics: vec![],
                data: Bytes::new(),
                removed: false,
            }])
        }

        async fn get_block(&self, _number: u64) -> Result<Option<BlockHeader>> {
            Ok(None)
        }

        async fn block_number(&self) -> Result<u64> {
            Ok(0)
        }
    }

    fn sub(byte: u8) -> LogSubscription {
        LogSubscription {
            address: Address::with_last_byte(byte),
            topics: vec![],
        }
    }

    #[tokio::test]
    async fn fetch_concatenates_all_subscriptions() {
        let rpc = Arc::new(FanOutRpc {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let fetcher = LogFetcher::with_parallel(rpc, 4);

        for byte in 1..=6 {
            assert!(fetcher.register(sub(byte)));
        }

        let logs = fetcher.fetch(100, 200).await.unwrap();
        assert_eq!(logs.len(), 6);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let rpc = Arc::new(FanOutRpc {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let fetcher = LogFetcher::with_parallel(Arc::clone(&rpc) as Arc<dyn ChainRpc>, 3);

        for byte in 1..=12 {
            fetcher.register(sub(byte));
        }

        fetcher.fetch(0, 10).await.unwrap();
        assert!(rpc.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn duplicate_registration_is_ignored() {
        let rpc = Arc::new(FanOutRpc {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let fetcher = LogFetcher::new(rpc);

        assert!(fetcher.register(sub(1)));
        assert!(!fetcher.register(sub(1)));
        assert_eq!(fetcher.subscriptions().len(), 1);
        assert!(fetcher.is_registered(Address::with_last_byte(1)));
    }
}
