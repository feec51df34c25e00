//! LRU block-header cache with per-key single-flight fetch.
//!
//! [`BlockCache::get_block`] guarantees at most one concurrent upstream fetch
//! per block number: the first caller starts the fetch, later callers for the
//! same number await the same outcome. Headers are immutable once confirmed,
//! so entries never expire - only LRU eviction bounds the cache.

use std::sync::Arc;

use moka::future::Cache as MokaCache;
use tracing::instrument;

use crate::error::{AppError, InfraError, Result};

use super::client::{BlockHeader, ChainRpc};

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Headers kept resident.
const CAPACITY: u64 = 100;

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK CACHE
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded header cache in front of a [`ChainRpc`].
pub struct BlockCache {
    client: Arc<dyn ChainRpc>,
    headers: MokaCache<u64, BlockHeader>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("entries", &self.headers.entry_count())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Create a cache over `client` with the default capacity.
    #[must_use]
    pub fn new(client: Arc<dyn ChainRpc>) -> Self {
        Self {
            client,
            headers: MokaCache::builder().max_capacity(CAPACITY).build(),
        }
    }

    /// Get the header for `number`, fetching it at most once concurrently.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not know the block (retry policy is
    /// the adapter's concern) or the fetch fails.
    #[instrument(skip(self))]
    pub async fn get_block(&self, number: u64) -> Result<BlockHeader> {
        let client = Arc::clone(&self.client);
        self.headers
            .try_get_with(number, async move {
                client.get_block(number).await?.ok_or_else(|| {
                    AppError::from(InfraError::Rpc(Box::new(std::io::Error::other(format!(
                        "block {number} not found"
                    )))))
                })
            })
            .await
            .map_err(|e: Arc<AppError>| {
                // The shared error loses ownership; re-wrap its message.
                InfraError::Internal(e.to_string()).into()
            })
    }

    /// Number of cached headers (eviction is processed lazily).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.headers.entry_count()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
