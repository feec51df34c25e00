//! Retrying HTTP RPC adapter.
//!
//! [`ChainRpc`] is the seam every pipeline component talks to; the production
//! implementation [`HttpChainClient`] wraps an Alloy provider and retries
//! transient failures with bounded backoff. Components never retry RPC calls
//! themselves - the adapter owns that policy.

use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::Filter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{instrument, warn};

use crate::error::{InfraError, Result};
use crate::types::ChainLog;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Attempts per RPC call before the error propagates.
const MAX_ATTEMPTS: u32 = 3;

/// Delay between attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK HEADER
// ═══════════════════════════════════════════════════════════════════════════════

/// The slice of a block header the indexer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Unix timestamp.
    pub timestamp: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN RPC TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-only chain access used by the pipeline.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// The chain id this client is connected to.
    fn chain_id(&self) -> u64;

    /// Fetch logs for one address over an inclusive block range, optionally
    /// narrowed by topic0 signatures.
    ///
    /// # Errors
    ///
    /// Returns an error after the adapter's retry budget is exhausted.
    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: Address,
        topics: &[B256],
    ) -> Result<Vec<ChainLog>>;

    /// Fetch a block header; `None` when the node does not know the block.
    ///
    /// # Errors
    ///
    /// Returns an error after the adapter's retry budget is exhausted.
    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>>;

    /// Current head block number.
    ///
    /// # Errors
    ///
    /// Returns an error after the adapter's retry budget is exhausted.
    async fn block_number(&self) -> Result<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Alloy-backed [`ChainRpc`] implementation over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChainClient {
    provider: RootProvider,
    chain_id: u64,
}

impl HttpChainClient {
    /// Connect to an HTTP RPC endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn connect(url: &str, chain_id: u64) -> Result<Self> {
        let parsed = url.parse().map_err(|e| {
            InfraError::Rpc(Box::new(std::io::Error::other(format!(
                "invalid RPC url {url}: {e}"
            ))))
        })?;
        Ok(Self {
            provider: RootProvider::new_http(parsed),
            chain_id,
        })
    }

    /// Run `op` with the adapter's retry policy.
    async fn retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, alloy::transports::TransportError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(InfraError::Rpc(Box::new(e)).into());
                    }
                    warn!(what, attempt, error = %e, "RPC call failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

#[async_trait]
impl ChainRpc for HttpChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    #[instrument(skip(self, topics), fields(chain = self.chain_id))]
    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        address: Address,
        topics: &[B256],
    ) -> Result<Vec<ChainLog>> {
        let mut filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block);
        if !topics.is_empty() {
            filter = filter.event_signature(topics.to_vec());
        }

        let raw = self
            .retry("eth_getLogs", || self.provider.get_logs(&filter))
            .await?;

        let mut logs = Vec::with_capacity(raw.len());
        for log in &raw {
            match ChainLog::from_rpc(self.chain_id, log) {
                Ok(log) => logs.push(log),
                // Pending logs carry no position and cannot be indexed.
                Err(field) => warn!(missing = %field, "Skipping log without {field}"),
            }
        }
        Ok(logs)
    }

    #[instrument(skip(self), fields(chain = self.chain_id))]
    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>> {
        let block = self
            .retry("eth_getBlockByNumber", || async move {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .await
            })
            .await?;

        Ok(block.map(|b| BlockHeader {
            number,
            hash: b.header.hash,
            parent_hash: b.header.parent_hash,
            timestamp: b.header.timestamp,
        }))
    }

    async fn block_number(&self) -> Result<u64> {
        self.retry("eth_blockNumber", || self.provider.get_block_number())
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_is_bounded() {
        assert!(MAX_ATTEMPTS >= 2);
        assert!(MAX_ATTEMPTS <= 10);
        assert!(RETRY_DELAY <= Duration::from_secs(5));
    }

    #[test]
    fn connect_rejects_garbage_url() {
        assert!(HttpChainClient::connect("not a url", 1).is_err());
    }
}
