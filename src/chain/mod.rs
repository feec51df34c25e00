//! Chain access layer.
//!
//! - [`client`] - retrying HTTP RPC adapter behind the [`ChainRpc`] trait
//! - [`block_cache`] - LRU block-header cache with single-flight fetch
//! - [`log_fetcher`] - parallel-bounded `getLogs` over subscriptions
//! - [`subscriber`] - push-based log/newHeads JSON-RPC WebSocket session

pub mod block_cache;
pub mod client;
pub mod log_fetcher;
pub mod subscriber;

pub use block_cache::BlockCache;
pub use client::{BlockHeader, ChainRpc, HttpChainClient};
pub use log_fetcher::{LogFetcher, LogSubscription};
pub use subscriber::{LogSubscriber, SubscriberEvent};
