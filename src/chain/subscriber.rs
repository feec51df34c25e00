//! Push-based log/newHeads subscription over a keep-alive JSON-RPC WebSocket.
//!
//! The subscriber owns a long-lived JSON-RPC session with the node:
//!
//! - **Keep-alive**: a ping every 3s; a missing pong within 1s declares the
//!   connection lost, emits [`SubscriberEvent::Loss`], and reconnects.
//! - **Reconnect**: after a 1s delay; on every (re)connect all stored
//!   subscriptions are re-issued (`eth_subscribe` `logs` + `newHeads`) and
//!   their subscription ids replaced.
//! - **Routing**: incoming `eth_subscription` notifications are matched
//!   against stored ids; unknown ids are dropped silently.
//! - **Queueing**: commands issued while disconnected wait in the command
//!   channel and are flushed in order once the session is back.
//! - **Request/response**: monotonically generated ids (wrapping); each
//!   request carries an independent 3s timeout; on loss every in-flight
//!   request is rejected with `loss connection`.
//! - **Removed logs**: a log notification with `removed=true` is surfaced as
//!   [`SubscriberEvent::Removed`] so the ingestor can de-queue the matching
//!   unconfirmed log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{B256, U64};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, InfraError, Result};
use crate::types::{ChainLog, LogPosition};

use super::client::BlockHeader;
use super::log_fetcher::LogSubscription;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Keep-alive ping cadence.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// How long a pong may lag before the connection is declared lost.
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before a reconnection attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Per-request response timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS & COMMANDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Events surfaced to the ingestor.
#[derive(Debug)]
pub enum SubscriberEvent {
    /// Session (re)established and subscriptions re-issued.
    Connected,
    /// Session lost; a reconnect will follow.
    Loss,
    /// A subscribed log arrived.
    Log(ChainLog),
    /// A previously delivered log was dropped by the node (reorg signal).
    Removed(LogPosition),
    /// A new head header arrived.
    NewHead(BlockHeader),
}

enum Command {
    Subscribe(LogSubscription),
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe(sub) => f.debug_tuple("Subscribe").field(&sub.address).finish(),
            Self::Request { method, .. } => f.debug_tuple("Request").field(method).finish(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOG SUBSCRIBER
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to the WebSocket subscription session.
pub struct LogSubscriber {
    url: String,
    chain_id: u64,
    subscriptions: Arc<RwLock<Vec<LogSubscription>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    events_tx: mpsc::UnboundedSender<SubscriberEvent>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for LogSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSubscriber")
            .field("url", &self.url)
            .field("chain_id", &self.chain_id)
            .field("subscriptions", &self.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl LogSubscriber {
    /// Create a subscriber for `url`; the returned receiver yields session
    /// events once [`Self::run`] is driving the connection.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        chain_id: u64,
    ) -> (Self, mpsc::UnboundedReceiver<SubscriberEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                url: url.into(),
                chain_id,
                subscriptions: Arc::new(RwLock::new(Vec::new())),
                cmd_tx,
                cmd_rx: parking_lot::Mutex::new(Some(cmd_rx)),
                events_tx,
                next_id: AtomicU64::new(1),
            },
            events_rx,
        )
    }

    /// Register a logs subscription.
    ///
    /// Stored for resubscription on every (re)connect; if a session is live
    /// the `eth_subscribe` goes out immediately (queued otherwise).
    pub fn register(&self, subscription: LogSubscription) {
        {
            let mut subs = self.subscriptions.write();
            if subs.iter().any(|s| s.address == subscription.address) {
                return;
            }
            subs.push(subscription.clone());
        }
        let _ = self.cmd_tx.send(Command::Subscribe(subscription));
    }

    /// Issue a raw JSON-RPC request over the session.
    ///
    /// # Errors
    ///
    /// Times out after 3s, or rejects with `loss connection` when the session
    /// drops while the request is in flight.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| InfraError::ChannelClosed("subscriber command".into()))?;

        match timeout(REQUEST_TIMEOUT, rx).await {
            Err(_) => Err(InfraError::Timeout(format!("request {method}")).into()),
            Ok(Err(_)) => Err(InfraError::ConnectionLost.into()),
            Ok(Ok(result)) => result,
        }
    }

    /// Drive the session until `shutdown` fires. Reconnects forever.
    ///
    /// # Panics
    ///
    /// Panics if called twice (the command receiver is taken by the first
    /// call).
    #[instrument(skip(self, shutdown), fields(url = %self.url))]
    pub async fn run(&self, shutdown: CancellationToken) {
        #[allow(clippy::expect_used)]
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .take()
            .expect("LogSubscriber::run called twice");

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.run_session(&mut cmd_rx, &shutdown).await {
                Ok(()) => return, // clean shutdown
                Err(e) => {
                    warn!(error = %e, "WebSocket session ended, reconnecting");
                    let _ = self.events_tx.send(SubscriberEvent::Loss);
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// One connection lifetime: connect, resubscribe, pump messages.
    ///
    /// `Ok(())` means shutdown; any error means the connection is gone.
    async fn run_session(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (ws, _) = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            conn = connect_async(self.url.as_str()) => {
                conn.map_err(|e| InfraError::Ws(format!("connect: {e}")))?
            }
        };
        info!("WebSocket connected");

        let (mut sink, mut stream) = ws.split();
        let mut session = SessionState::new(self.chain_id);

        // Re-issue every stored subscription plus the newHeads feed; the old
        // subscription ids are gone with the previous connection.
        let subscriptions = self.subscriptions.read().clone();
        for sub in &subscriptions {
            let frame = session.subscribe_logs_frame(self.alloc_id(), sub);
            sink.send(Message::Text(frame.into()))
                .await
                .map_err(|e| InfraError::Ws(format!("subscribe: {e}")))?;
        }
        let frame = session.subscribe_heads_frame(self.alloc_id());
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| InfraError::Ws(format!("subscribe: {e}")))?;

        let _ = self.events_tx.send(SubscriberEvent::Connected);

        let mut ping_timer = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        let result: Result<()> = loop {
            let awaited_pong = pong_deadline;
            let pong_sleep = async move {
                match awaited_pong {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break Ok(()),

                _ = ping_timer.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        break Err(InfraError::Ws(format!("ping: {e}")).into());
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + KEEP_ALIVE_TIMEOUT);
                    }
                }

                () = pong_sleep => {
                    break Err(InfraError::Ws("pong timeout".into()).into());
                }

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break Err(InfraError::ChannelClosed("subscriber command".into()).into());
                    };
                    let frame = match cmd {
                        Command::Subscribe(sub) => {
                            if session.is_subscribed(&sub) {
                                continue;
                            }
                            Some(session.subscribe_logs_frame(self.alloc_id(), &sub))
                        }
                        Command::Request { method, params, reply } => {
                            Some(session.request_frame(self.alloc_id(), &method, params, reply))
                        }
                    };
                    if let Some(frame) = frame {
                        if let Err(e) = sink.send(Message::Text(frame.into())).await {
                            break Err(InfraError::Ws(format!("send: {e}")).into());
                        }
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for event in session.handle_text(&text) {
                                let _ = self.events_tx.send(event);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pong_deadline = None;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = sink.send(Message::Pong(payload)).await {
                                break Err(InfraError::Ws(format!("pong: {e}")).into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(InfraError::Ws("closed by peer".into()).into());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            break Err(InfraError::Ws(format!("recv: {e}")).into());
                        }
                    }
                }
            }
        };

        session.reject_in_flight();
        result
    }

    /// Next request id; wraps on overflow.
    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SESSION STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// What a pending request id resolves into.
enum Pending {
    /// An `eth_subscribe` whose result is the subscription id to store.
    Subscribe(SubKind),
    /// An external request with a caller waiting.
    External(oneshot::Sender<Result<Value>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubKind {
    Logs(alloy::primitives::Address),
    NewHeads,
}

/// Per-connection bookkeeping, separated from socket I/O for testability.
struct SessionState {
    chain_id: u64,
    pending: HashMap<u64, Pending>,
    sub_ids: HashMap<String, SubKind>,
    subscribed: Vec<alloy::primitives::Address>,
}

impl SessionState {
    fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            pending: HashMap::new(),
            sub_ids: HashMap::new(),
            subscribed: Vec::new(),
        }
    }

    fn is_subscribed(&self, sub: &LogSubscription) -> bool {
        self.subscribed.contains(&sub.address)
    }

    /// Build an `eth_subscribe logs` frame and track its pending id.
    fn subscribe_logs_frame(&mut self, id: u64, sub: &LogSubscription) -> String {
        self.pending.insert(id, Pending::Subscribe(SubKind::Logs(sub.address)));
        self.subscribed.push(sub.address);
        let mut params = json!({ "address": sub.address });
        if !sub.topics.is_empty() {
            params["topics"] = json!([sub.topics]);
        }
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_subscribe",
            "params": ["logs", params],
        })
        .to_string()
    }

    /// Build an `eth_subscribe newHeads` frame and track its pending id.
    fn subscribe_heads_frame(&mut self, id: u64) -> String {
        self.pending.insert(id, Pending::Subscribe(SubKind::NewHeads));
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_subscribe",
            "params": ["newHeads"],
        })
        .to_string()
    }

    /// Build an external request frame and register its reply channel.
    fn request_frame(
        &mut self,
        id: u64,
        method: &str,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    ) -> String {
        self.pending.insert(id, Pending::External(reply));
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string()
    }

    /// Route one incoming text frame, returning events to surface.
    fn handle_text(&mut self, text: &str) -> Vec<SubscriberEvent> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            warn!("Dropping unparseable frame");
            return vec![];
        };

        if value.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            return self.handle_notification(&value);
        }

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            self.handle_response(id, &value);
        }
        vec![]
    }

    fn handle_response(&mut self, id: u64, value: &Value) {
        let Some(pending) = self.pending.remove(&id) else {
            return;
        };

        let outcome: Result<Value> = if let Some(error) = value.get("error") {
            Err(InfraError::Ws(error.to_string()).into())
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };

        match pending {
            Pending::Subscribe(kind) => match outcome {
                Ok(Value::String(sub_id)) => {
                    debug!(%sub_id, ?kind, "Subscription established");
                    self.sub_ids.insert(sub_id, kind);
                }
                Ok(other) => warn!(?other, "Unexpected eth_subscribe result"),
                Err(e) => warn!(error = %e, "eth_subscribe rejected"),
            },
            Pending::External(reply) => {
                let _ = reply.send(outcome);
            }
        }
    }

    fn handle_notification(&mut self, value: &Value) -> Vec<SubscriberEvent> {
        let params = &value["params"];
        let Some(sub_id) = params.get("subscription").and_then(Value::as_str) else {
            return vec![];
        };
        // Unknown subscription ids are dropped silently - they belong to a
        // previous connection.
        let Some(kind) = self.sub_ids.get(sub_id) else {
            return vec![];
        };

        match kind {
            SubKind::NewHeads => match serde_json::from_value::<HeadNotification>(
                params["result"].clone(),
            ) {
                Ok(head) => vec![SubscriberEvent::NewHead(head.into_header())],
                Err(e) => {
                    warn!(error = %e, "Malformed newHeads notification");
                    vec![]
                }
            },
            SubKind::Logs(_) => match serde_json::from_value::<alloy::rpc::types::Log>(
                params["result"].clone(),
            ) {
                Ok(raw) => match ChainLog::from_rpc(self.chain_id, &raw) {
                    Ok(log) if log.removed => vec![SubscriberEvent::Removed(log.position())],
                    Ok(log) => vec![SubscriberEvent::Log(log)],
                    Err(field) => {
                        warn!(missing = %field, "Subscription log missing {field}");
                        vec![]
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Malformed log notification");
                    vec![]
                }
            },
        }
    }

    /// Reject every in-flight external request with `loss connection`.
    fn reject_in_flight(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Pending::External(reply) = pending {
                let _ = reply.send(Err(AppError::from(InfraError::ConnectionLost)));
            }
        }
        self.sub_ids.clear();
        self.subscribed.clear();
    }
}

/// The subset of a `newHeads` notification the indexer consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadNotification {
    number: U64,
    hash: B256,
    parent_hash: B256,
    timestamp: U64,
}

impl HeadNotification {
    fn into_header(self) -> BlockHeader {
        BlockHeader {
            number: self.number.to::<u64>(),
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp.to::<u64>(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
