//! On-demand snapshot materialization and API method dispatch.
//!
//! The handler owns the `generated` snapshot map (keyed by snapshot-id
//! string) and the `generating` set. `generateSnapshot` materializes a
//! snapshot at an arbitrary position by replaying from the nearest stored
//! base; a second request for the same id while that runs gets the
//! `generating` code. Generation carries a composite cancellation signal -
//! process shutdown plus a per-id aborter that a reorg fires for every id at
//! or above the divergence block (generated entries there are evicted).
//!
//! Query methods read either the live snapshot (no `id`) or a generated one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{AppError, DomainError, InfraError, Result};
use crate::ports::SnapshotBackend;
use crate::snapshot::{Snapshot, SnapshotDriver, generate};
use crate::types::{LogPosition, SnapshotId};

// ═══════════════════════════════════════════════════════════════════════════════
// PARAMS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GenerateParams {
    block_number: u64,
    transaction_index: Option<u64>,
    log_index: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryAccountParams {
    id: Option<String>,
    address: String,
    instrument: String,
    expiry: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryAmmParams {
    id: Option<String>,
    instrument: String,
    expiry: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressParams {
    address: String,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| DomainError::InvalidParams(e.to_string()).into())
}

fn parse_address(text: &str) -> Result<Address> {
    text.parse()
        .map_err(|_| DomainError::InvalidParams(format!("bad address: {text}")).into())
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST HANDLER
// ═══════════════════════════════════════════════════════════════════════════════

struct Generated {
    position: LogPosition,
    snapshot: Snapshot,
}

/// A spawned generation: outlives the request that started it, cleans up the
/// `generating` entry on every path, and registers the result.
struct GenerationJob {
    chain_id: u64,
    backend: Arc<dyn SnapshotBackend>,
    generated: GeneratedMap,
    generating: GeneratingMap,
}

impl GenerationJob {
    async fn run(
        self,
        snap_id: String,
        position: LogPosition,
        aborter: CancellationToken,
    ) -> Result<()> {
        let result = generate(self.backend.as_ref(), position, None, Some(&aborter)).await;
        self.generating.lock().remove(&snap_id);

        match result {
            Ok((snapshot, landed)) => {
                info!(id = %snap_id, %landed, "Snapshot generated");
                let generated = Arc::new(Generated {
                    position: landed,
                    snapshot,
                });
                let mut map = self.generated.lock();
                // A replay rarely lands exactly on the requested position;
                // register the landed id too so both resolve.
                if landed != position && !landed.is_block_bound() {
                    let landed_id = SnapshotId::from_position(self.chain_id, landed).to_string();
                    map.insert(landed_id, Arc::clone(&generated));
                }
                map.insert(snap_id, generated);
                Ok(())
            }
            Err(e) => {
                warn!(id = %snap_id, error = %e, "Snapshot generation failed");
                Err(e)
            }
        }
    }
}

type GeneratedMap = Arc<parking_lot::Mutex<HashMap<String, Arc<Generated>>>>;
type GeneratingMap = Arc<parking_lot::Mutex<HashMap<String, CancellationToken>>>;

/// See the module docs.
pub struct RequestHandler {
    chain_id: u64,
    driver: Arc<SnapshotDriver>,
    backend: Arc<dyn SnapshotBackend>,
    generated: GeneratedMap,
    generating: GeneratingMap,
    order_filled: Arc<parking_lot::RwLock<HashSet<Address>>>,
    shutdown: CancellationToken,
    generate_wait: Duration,
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("chain_id", &self.chain_id)
            .field("generated", &self.generated.lock().len())
            .field("generating", &self.generating.lock().len())
            .finish_non_exhaustive()
    }
}

impl RequestHandler {
    /// Create a handler. `order_filled` is the fan-out filter set, shared
    /// with the MQ forwarder. `generate_wait` bounds how long
    /// `generateSnapshot` waits before answering `generating`.
    #[must_use]
    pub fn new(
        chain_id: u64,
        driver: Arc<SnapshotDriver>,
        backend: Arc<dyn SnapshotBackend>,
        order_filled: Arc<parking_lot::RwLock<HashSet<Address>>>,
        shutdown: CancellationToken,
        generate_wait: Duration,
    ) -> Self {
        Self {
            chain_id,
            driver,
            backend,
            generated: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            generating: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            order_filled,
            shutdown,
            generate_wait,
        }
    }

    /// Dispatch one API method.
    ///
    /// # Errors
    ///
    /// Domain errors map to the wire codes in [`super::rpc`].
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "generateSnapshot" => self.generate_snapshot(params).await,
            "clearSnapshot" => self.clear_snapshot(&params),
            "listSnapshots" => self.list_snapshots(),
            "queryAccount" => self.query_account(params),
            "queryAMM" => self.query_amm(params),
            "subscribeOrderFilled" => self.subscribe_order_filled(params, true),
            "unsubscribeOrderFilled" => self.subscribe_order_filled(params, false),
            other => Err(DomainError::MethodNotFound(other.to_string()).into()),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Snapshot lifecycle
    // ───────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, params))]
    async fn generate_snapshot(&self, params: Value) -> Result<Value> {
        let params: GenerateParams = parse_params(params)?;
        let position = match (params.transaction_index, params.log_index) {
            (Some(tx), Some(log)) => LogPosition::new(params.block_number, tx, log),
            (None, None) => LogPosition::block_end(params.block_number),
            _ => {
                return Err(DomainError::InvalidParams(
                    "transactionIndex and logIndex must both be present or both absent".into(),
                )
                .into());
            }
        };
        let snap_id = SnapshotId::from_position(self.chain_id, position).to_string();

        if self.generated.lock().contains_key(&snap_id) {
            return Ok(json!(snap_id));
        }

        let aborter = {
            let mut generating = self.generating.lock();
            if generating.contains_key(&snap_id) {
                return Err(DomainError::Generating(snap_id).into());
            }
            let aborter = self.shutdown.child_token();
            generating.insert(snap_id.clone(), aborter.clone());
            aborter
        };

        let task = {
            let job = GenerationJob {
                chain_id: self.chain_id,
                backend: Arc::clone(&self.backend),
                generated: Arc::clone(&self.generated),
                generating: Arc::clone(&self.generating),
            };
            let snap_id = snap_id.clone();
            tokio::spawn(async move { job.run(snap_id, position, aborter).await })
        };

        // Wait a bounded time; a long replay answers `generating` and the
        // client polls with the same parameters.
        match tokio::time::timeout(self.generate_wait, task).await {
            Ok(Ok(result)) => {
                result?;
                Ok(json!(snap_id))
            }
            Ok(Err(join_error)) => {
                Err(InfraError::Internal(format!("generation panicked: {join_error}")).into())
            }
            Err(_) => Err(DomainError::Generating(snap_id).into()),
        }
    }

    fn clear_snapshot(&self, params: &Value) -> Result<Value> {
        let Value::String(id) = params else {
            return Err(DomainError::InvalidParams("snapshot id string expected".into()).into());
        };
        let _: SnapshotId = id
            .parse()
            .map_err(|e: crate::types::InvalidSnapshotId| {
                AppError::from(DomainError::InvalidParams(e.to_string()))
            })?;
        let removed = self.generated.lock().remove(id).is_some();
        Ok(json!(removed))
    }

    fn list_snapshots(&self) -> Result<Value> {
        let generated = self.generated.lock();
        let mut out = serde_json::Map::new();
        for (id, entry) in generated.iter() {
            let parsed: SnapshotId = match id.parse() {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };
            let mut body = serde_json::Map::new();
            body.insert("chainId".into(), json!(parsed.chain_id));
            body.insert("blockNumber".into(), json!(entry.position.block_number));
            if let Some((tx, log)) = parsed.exact {
                body.insert("transactionIndex".into(), json!(tx));
                body.insert("logIndex".into(), json!(log));
            }
            out.insert(id.clone(), Value::Object(body));
        }
        Ok(Value::Object(out))
    }

    /// Evict and abort everything invalidated by a reorg at `reorg_block`.
    pub fn on_reorged(&self, reorg_block: u64) {
        {
            let generating = self.generating.lock();
            for (id, aborter) in generating.iter() {
                let invalidated = id
                    .parse::<SnapshotId>()
                    .is_ok_and(|parsed| parsed.block_number >= reorg_block);
                if invalidated {
                    info!(%id, reorg_block, "Aborting in-flight generation");
                    aborter.cancel();
                }
            }
        }
        let mut generated = self.generated.lock();
        let before = generated.len();
        generated.retain(|_, entry| entry.position.block_number < reorg_block);
        let evicted = before - generated.len();
        if evicted > 0 {
            info!(evicted, reorg_block, "Evicted generated snapshots");
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Queries
    // ───────────────────────────────────────────────────────────────────────────

    /// Run `f` against the live snapshot (no id) or a generated one.
    fn with_snapshot<R>(
        &self,
        id: Option<&str>,
        f: impl FnOnce(&Snapshot) -> Result<R>,
    ) -> Result<R> {
        match id {
            None => self.driver.with_live(|snapshot, _| f(snapshot))?,
            Some(id) => {
                let entry = self.generated.lock().get(id).cloned();
                if let Some(entry) = entry {
                    return f(&entry.snapshot);
                }
                if self.generating.lock().contains_key(id) {
                    return Err(DomainError::Generating(id.to_string()).into());
                }
                Err(DomainError::SnapshotNotFound(id.to_string()).into())
            }
        }
    }

    fn query_account(&self, params: Value) -> Result<Value> {
        let params: QueryAccountParams = parse_params(params)?;
        let trader = parse_address(&params.address)?;
        let instrument = parse_address(&params.instrument)?;

        self.with_snapshot(params.id.as_deref(), |snapshot| {
            let market = snapshot.instrument(instrument).ok_or_else(|| {
                AppError::from(DomainError::InstrumentNotFound(params.instrument.clone()))
            })?;
            let account = market.account(trader, params.expiry).ok_or_else(|| {
                AppError::from(DomainError::AccountNotFound {
                    trader: params.address.clone(),
                    instrument: params.instrument.clone(),
                    expiry: params.expiry,
                })
            })?;

            Ok(json!({
                "onumber": account.orders.len(),
                "rnumber": account.ranges.len(),
                "oids": account.orders.keys().collect::<Vec<_>>(),
                "rids": account.ranges.keys().collect::<Vec<_>>(),
                "position": serde_json::to_value(&account.position)
                    .map_err(InfraError::Serialization)?,
                "orders": serde_json::to_value(&account.orders)
                    .map_err(InfraError::Serialization)?,
                "ranges": serde_json::to_value(&account.ranges)
                    .map_err(InfraError::Serialization)?,
            }))
        })
    }

    fn query_amm(&self, params: Value) -> Result<Value> {
        let params: QueryAmmParams = parse_params(params)?;
        let instrument = parse_address(&params.instrument)?;

        self.with_snapshot(params.id.as_deref(), |snapshot| {
            let market = snapshot.instrument(instrument).ok_or_else(|| {
                AppError::from(DomainError::InstrumentNotFound(params.instrument.clone()))
            })?;
            let pair = market.pairs.get(&params.expiry).ok_or_else(|| {
                AppError::from(DomainError::PairNotFound {
                    instrument: params.instrument.clone(),
                    expiry: params.expiry,
                })
            })?;
            Ok(serde_json::to_value(pair).map_err(InfraError::Serialization)?)
        })
    }

    fn subscribe_order_filled(&self, params: Value, subscribe: bool) -> Result<Value> {
        let params: AddressParams = parse_params(params)?;
        let address = parse_address(&params.address)?;
        if subscribe {
            self.order_filled.write().insert(address);
        } else {
            self.order_filled.write().remove(&address);
        }
        Ok(json!(true))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use alloy::primitives::{B256, Bytes, I256, U256};
    use async_trait::async_trait;

    use crate::abi::{ProtocolEvent, instrument};
    use crate::types::{ChainLog, EventStatus, StoredEvent};

    use super::*;

    const MARKET: Address = Address::repeat_byte(0x14);
    const TRADER: Address = Address::repeat_byte(0x77);

    /// In-memory backend with an optional per-batch delay.
    #[derive(Debug, Default)]
    struct MemBackend {
        events: parking_lot::Mutex<Vec<StoredEvent>>,
        snapshots: parking_lot::Mutex<BTreeMap<LogPosition, Value>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SnapshotBackend for MemBackend {
        async fn next_batch(
            &self,
            after: Option<LogPosition>,
            to: Option<LogPosition>,
            limit: usize,
        ) -> Result<Vec<StoredEvent>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .events
                .lock()
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
        ) -> Result<Option<(LogPosition, Value)>> {
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
            state: Value,
            _prune_before: u64,
        ) -> Result<()> {
            self.snapshots.lock().insert(position, state);
            Ok(())
        }

        async fn persisted_block(&self) -> Result<Option<u64>> {
            Ok(None)
        }
    }

    fn trade_stored(block: u64, tx: u64, log_index: u64) -> StoredEvent {
        let parsed = ProtocolEvent::Trade(instrument::Trade {
            trader: TRADER,
            expiry: u32::MAX,
            size: I256::try_from(1000).unwrap(),
            amount: U256::from(5000u64),
            sqrtPX96: U256::from(1u64) << 96,
            tick: 15777,
            feeRatio: U256::from(30u64),
        });
        StoredEvent {
            log: ChainLog {
                chain_id: 81457,
                address: MARKET,
                block_number: block,
                block_hash: B256::repeat_byte(1),
                tx_hash: B256::repeat_byte(2),
                transaction_index: tx,
                log_index,
                topics: vec![],
                data: Bytes::new(),
                removed: false,
            },
            name: "Trade".into(),
            payload: parsed.to_payload().unwrap(),
            timestamp: None,
            status: EventStatus::default().processed(),
        }
    }

    fn status_stored(block: u64) -> StoredEvent {
        let parsed = ProtocolEvent::UpdateAmmStatus(instrument::UpdateAmmStatus {
            expiry: u32::MAX,
            status: 1,
            sqrtPX96: U256::from(1u64) << 96,
            tick: 15777,
        });
        let mut stored = trade_stored(block, 0, 0);
        stored.name = "UpdateAmmStatus".into();
        stored.payload = parsed.to_payload().unwrap();
        stored
    }

    async fn handler_with(
        backend: Arc<MemBackend>,
        wait: Duration,
    ) -> (Arc<RequestHandler>, CancellationToken) {
        let driver = Arc::new(SnapshotDriver::new(
            Arc::clone(&backend) as Arc<dyn SnapshotBackend>,
            1800,
            43200,
        ));
        let shutdown = CancellationToken::new();
        {
            let driver = Arc::clone(&driver);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { driver.run(shutdown).await });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let handler = Arc::new(RequestHandler::new(
            81457,
            driver,
            backend as Arc<dyn SnapshotBackend>,
            Arc::new(parking_lot::RwLock::new(HashSet::new())),
            shutdown.clone(),
            wait,
        ));
        (handler, shutdown)
    }

    #[tokio::test]
    async fn snapshot_id_wire_format() {
        let backend = Arc::new(MemBackend::default());
        backend.events.lock().push(trade_stored(2_737_538, 10, 23));
        let (handler, _shutdown) = handler_with(backend, Duration::from_secs(2)).await;

        let id = handler
            .dispatch(
                "generateSnapshot",
                json!({"blockNumber": 2_737_538u64, "transactionIndex": 10, "logIndex": 23}),
            )
            .await
            .unwrap();
        assert_eq!(id, json!("81457-2737538-10-23"));

        // Half-specified position is invalid.
        let err = handler
            .dispatch(
                "generateSnapshot",
                json!({"blockNumber": 2_737_538u64, "transactionIndex": 10}),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Domain(DomainError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn slow_generation_answers_generating_then_completes() {
        let backend = Arc::new(MemBackend {
            delay: Some(Duration::from_millis(150)),
            ..MemBackend::default()
        });
        backend.events.lock().push(trade_stored(100, 0, 0));
        let (handler, _shutdown) = handler_with(backend, Duration::from_millis(20)).await;

        let err = handler
            .dispatch("generateSnapshot", json!({"blockNumber": 100u64}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Domain(DomainError::Generating(_))));

        // Once the background task finishes, the same call returns the id.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let id = handler
            .dispatch("generateSnapshot", json!({"blockNumber": 100u64}))
            .await
            .unwrap();
        assert_eq!(id, json!("81457-100"));

        let listed = handler.dispatch("listSnapshots", json!({})).await.unwrap();
        assert!(listed.get("81457-100").is_some());
    }

    #[tokio::test]
    async fn query_amm_shape() {
        let backend = Arc::new(MemBackend::default());
        backend.events.lock().push(status_stored(99));
        backend.events.lock().push(trade_stored(100, 0, 1));
        let (handler, _shutdown) = handler_with(backend, Duration::from_secs(2)).await;

        let amm = handler
            .dispatch(
                "queryAMM",
                json!({"instrument": format!("{MARKET:#x}"), "expiry": u32::MAX}),
            )
            .await
            .unwrap();

        assert_eq!(amm["status"], 1);
        assert_eq!(amm["tick"], 15777);
        assert_eq!(amm["totalLong"], "1000");
        assert_eq!(amm["openInterests"], "5000");
        // 18 wire fields exactly.
        assert_eq!(amm.as_object().unwrap().len(), 18);
    }

    #[tokio::test]
    async fn query_account_shape() {
        let backend = Arc::new(MemBackend::default());
        backend.events.lock().push(trade_stored(100, 0, 1));
        let (handler, _shutdown) = handler_with(backend, Duration::from_secs(2)).await;

        let account = handler
            .dispatch(
                "queryAccount",
                json!({
                    "address": format!("{TRADER:#x}"),
                    "instrument": format!("{MARKET:#x}"),
                    "expiry": u32::MAX,
                }),
            )
            .await
            .unwrap();

        assert_eq!(account["onumber"], 0);
        assert_eq!(account["rnumber"], 0);
        assert_eq!(account["position"]["size"], "1000");
        assert_eq!(account["position"]["entryNotional"], "5000");

        // Unknown trader: not found.
        let err = handler
            .dispatch(
                "queryAccount",
                json!({
                    "address": format!("{:#x}", Address::repeat_byte(0x01)),
                    "instrument": format!("{MARKET:#x}"),
                    "expiry": u32::MAX,
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Domain(DomainError::AccountNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn clear_and_reorg_evict_generated() {
        let backend = Arc::new(MemBackend::default());
        backend.events.lock().push(trade_stored(100, 0, 0));
        backend.events.lock().push(trade_stored(990, 0, 0));
        let (handler, _shutdown) = handler_with(backend, Duration::from_secs(2)).await;

        handler
            .dispatch("generateSnapshot", json!({"blockNumber": 100u64}))
            .await
            .unwrap();
        handler
            .dispatch("generateSnapshot", json!({"blockNumber": 990u64}))
            .await
            .unwrap();

        // Reorg at 980 evicts only the generated snapshot above it.
        handler.on_reorged(980);
        let listed = handler.dispatch("listSnapshots", json!({})).await.unwrap();
        assert!(listed.get("81457-100").is_some());
        assert!(listed.get("81457-990").is_none());

        // clearSnapshot returns whether a row was evicted.
        let cleared = handler
            .dispatch("clearSnapshot", json!("81457-100"))
            .await
            .unwrap();
        assert_eq!(cleared, json!(true));
        let cleared = handler
            .dispatch("clearSnapshot", json!("81457-100"))
            .await
            .unwrap();
        assert_eq!(cleared, json!(false));

        // Malformed id: invalid params.
        let err = handler
            .dispatch("clearSnapshot", json!("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Domain(DomainError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn subscribe_order_filled_updates_shared_set() {
        let backend = Arc::new(MemBackend::default());
        let (handler, _shutdown) = handler_with(backend, Duration::from_secs(2)).await;

        let ok = handler
            .dispatch(
                "subscribeOrderFilled",
                json!({"address": format!("{TRADER:#x}")}),
            )
            .await
            .unwrap();
        assert_eq!(ok, json!(true));
        assert!(handler.order_filled.read().contains(&TRADER));

        handler
            .dispatch(
                "unsubscribeOrderFilled",
                json!({"address": format!("{TRADER:#x}")}),
            )
            .await
            .unwrap();
        assert!(!handler.order_filled.read().contains(&TRADER));
    }

    #[tokio::test]
    async fn unknown_method_not_found() {
        let backend = Arc::new(MemBackend::default());
        let (handler, _shutdown) = handler_with(backend, Duration::from_secs(2)).await;

        let err = handler.dispatch("frobnicate", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Domain(DomainError::MethodNotFound(_))
        ));
    }
}
