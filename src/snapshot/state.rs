//! Deterministic application state replayed from parsed logs.
//!
//! A [`Snapshot`] is built by applying parsed events in stream-position
//! order: `S = S₀.apply(e₁).apply(e₂)…`. Applying the same events in the
//! same order from any base always yields the same serialized state - that
//! determinism is what lets the service answer queries at arbitrary
//! historical positions by replaying from the nearest stored snapshot.
//!
//! All maps are `BTreeMap` so serialization is order-stable, and all big
//! numerics serialize as decimal strings.

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, I256, U256};
use serde::{Deserialize, Serialize};

use crate::abi::ProtocolEvent;
use crate::error::{InfraError, Result};
use crate::types::{ChainLog, dec};

// ═══════════════════════════════════════════════════════════════════════════════
// PAIR STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// AMM state of one `(instrument, expiry)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PairState {
    /// Pair expiry (`4294967295` = perpetual).
    pub expiry: u32,
    /// Block number of the last pair mutation (monotonic stamp).
    pub timestamp: u64,
    /// AMM status: 0 Dormant, 1 Trading, 2 Settling, 3 Settled.
    pub status: u8,
    /// Current tick.
    pub tick: i32,
    /// Current sqrt price, Q64.96.
    #[serde(with = "dec::u256")]
    pub sqrt_p_x96: U256,
    /// Active liquidity.
    #[serde(with = "dec::u256")]
    pub liquidity: U256,
    /// Liquidity across all ranges.
    #[serde(with = "dec::u256")]
    pub total_liquidity: U256,
    /// Collateral gathered into the pair.
    #[serde(with = "dec::u256")]
    pub involved_fund: U256,
    /// Cumulative traded notional.
    #[serde(with = "dec::u256")]
    pub open_interests: U256,
    /// Fee accumulator.
    #[serde(with = "dec::u256")]
    pub fee_index: U256,
    /// Protocol fee accumulator.
    #[serde(with = "dec::u256")]
    pub protocol_fee: U256,
    /// Total long base size.
    #[serde(with = "dec::u256")]
    pub total_long: U256,
    /// Total short base size.
    #[serde(with = "dec::u256")]
    pub total_short: U256,
    /// Long-side social loss index.
    #[serde(with = "dec::u256")]
    pub long_social_loss_index: U256,
    /// Short-side social loss index.
    #[serde(with = "dec::u256")]
    pub short_social_loss_index: U256,
    /// Long-side funding index.
    #[serde(with = "dec::i256")]
    pub long_funding_index: I256,
    /// Short-side funding index.
    #[serde(with = "dec::i256")]
    pub short_funding_index: I256,
    /// Insurance fund balance.
    #[serde(with = "dec::u256")]
    pub insurance_fund: U256,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACCOUNT STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// A trader's net position within a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PositionState {
    /// Position margin balance.
    #[serde(with = "dec::u256")]
    pub balance: U256,
    /// Signed base size.
    #[serde(with = "dec::i256")]
    pub size: I256,
    /// Cumulative entry notional.
    #[serde(with = "dec::u256")]
    pub entry_notional: U256,
    /// Social loss index at entry.
    #[serde(with = "dec::u256")]
    pub entry_social_loss_index: U256,
    /// Funding index at entry.
    #[serde(with = "dec::i256")]
    pub entry_funding_index: I256,
}

/// One resting limit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrderState {
    /// Price tick of the order.
    pub tick: i32,
    /// Signed base size.
    #[serde(with = "dec::i256")]
    pub size: I256,
    /// Margin locked behind the order.
    #[serde(with = "dec::u256")]
    pub balance: U256,
}

/// One liquidity range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RangeState {
    /// Lower tick bound.
    pub tick_lower: i32,
    /// Upper tick bound.
    pub tick_upper: i32,
    /// Range liquidity.
    #[serde(with = "dec::u256")]
    pub liquidity: U256,
    /// Margin behind the range.
    #[serde(with = "dec::u256")]
    pub balance: U256,
    /// Sqrt price at entry.
    #[serde(with = "dec::u256")]
    pub sqrt_entry_p_x96: U256,
    /// Fee index at entry.
    #[serde(with = "dec::u256")]
    pub entry_fee_index: U256,
}

/// A trader's full account within a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    /// Net position.
    pub position: PositionState,
    /// Resting orders by oid.
    pub orders: BTreeMap<u32, OrderState>,
    /// Open ranges by rid.
    pub ranges: BTreeMap<u32, RangeState>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// INSTRUMENT STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// One instrument market: its pairs and the accounts in them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentState {
    /// Market symbol from the discovery event.
    pub symbol: String,
    /// AMM pairs by expiry.
    pub pairs: BTreeMap<u32, PairState>,
    /// Accounts by trader, then expiry.
    pub accounts: BTreeMap<Address, BTreeMap<u32, AccountState>>,
}

impl InstrumentState {
    /// The account at `(trader, expiry)`, if any.
    #[must_use]
    pub fn account(&self, trader: Address, expiry: u32) -> Option<&AccountState> {
        self.accounts.get(&trader).and_then(|m| m.get(&expiry))
    }

    fn account_mut(&mut self, trader: Address, expiry: u32) -> &mut AccountState {
        self.accounts.entry(trader).or_default().entry(expiry).or_default()
    }

    fn pair_mut(&mut self, expiry: u32) -> &mut PairState {
        let pair = self.pairs.entry(expiry).or_default();
        pair.expiry = expiry;
        pair
    }
}

/// Per-quote fee parameters from the Config contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuoteParam {
    /// Trading fee ratio, basis points.
    pub trading_fee_ratio: u16,
    /// Protocol fee ratio, basis points.
    pub protocol_fee_ratio: u16,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// The full protocol state at a stream position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Instruments by address.
    pub instruments: BTreeMap<Address, InstrumentState>,
    /// Gate custody: quote → trader → balance.
    pub balances: BTreeMap<Address, BTreeMap<Address, BalanceDec>>,
    /// Fee parameters by quote token.
    pub quote_params: BTreeMap<Address, QuoteParam>,
    /// Registered market implementations by type.
    pub markets: BTreeMap<B256, MarketInfo>,
}

/// Decimal-string wrapper for custody balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct BalanceDec(#[serde(with = "dec::u256")] pub U256);

/// A registered market implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketInfo {
    /// Implementation address.
    pub market: Address,
    /// Beacon address.
    pub beacon: Address,
}

impl Snapshot {
    /// Apply one parsed event. The caller guarantees stream-position order;
    /// the mutation itself is position-insensitive.
    #[allow(clippy::too_many_lines)] // One arm per event; splitting obscures the dispatch
    pub fn apply(&mut self, log: &ChainLog, event: &ProtocolEvent) {
        let block = log.block_number;
        match event {
            // ─── Gate ─────────────────────────────────────────────────────
            ProtocolEvent::NewInstrument(e) => {
                let entry = self.instruments.entry(e.instrument).or_default();
                entry.symbol.clone_from(&e.symbol);
            }
            ProtocolEvent::Deposit(e) => {
                let balance = self
                    .balances
                    .entry(e.quote)
                    .or_default()
                    .entry(e.trader)
                    .or_default();
                balance.0 = balance.0.saturating_add(e.quantity);
            }
            ProtocolEvent::Withdraw(e) => {
                let balance = self
                    .balances
                    .entry(e.quote)
                    .or_default()
                    .entry(e.trader)
                    .or_default();
                balance.0 = balance.0.saturating_sub(e.quantity);
            }
            ProtocolEvent::Gather(e) => {
                let instrument = self.instruments.entry(e.instrument).or_default();
                let pair = instrument.pair_mut(e.expiry);
                pair.involved_fund = pair.involved_fund.saturating_add(e.quantity);
                pair.timestamp = block;
                let account = instrument.account_mut(e.trader, e.expiry);
                account.position.balance = account.position.balance.saturating_add(e.quantity);
            }
            ProtocolEvent::Scatter(e) => {
                let instrument = self.instruments.entry(e.instrument).or_default();
                let pair = instrument.pair_mut(e.expiry);
                pair.involved_fund = pair.involved_fund.saturating_sub(e.quantity);
                pair.timestamp = block;
                let account = instrument.account_mut(e.trader, e.expiry);
                account.position.balance = account.position.balance.saturating_sub(e.quantity);
            }

            // ─── Config ───────────────────────────────────────────────────
            ProtocolEvent::SetQuoteParam(e) => {
                self.quote_params.insert(
                    e.quote,
                    QuoteParam {
                        trading_fee_ratio: e.tradingFeeRatio,
                        protocol_fee_ratio: e.protocolFeeRatio,
                    },
                );
            }
            ProtocolEvent::SetMarketInfo(e) => {
                self.markets.insert(
                    e.marketType,
                    MarketInfo {
                        market: e.market,
                        beacon: e.beacon,
                    },
                );
            }

            // ─── Instrument: AMM lifecycle ────────────────────────────────
            ProtocolEvent::UpdateAmmStatus(e) => {
                let pair = self.instrument_mut(log.address).pair_mut(e.expiry);
                pair.status = e.status;
                pair.sqrt_p_x96 = e.sqrtPX96;
                pair.tick = e.tick;
                pair.timestamp = block;
            }
            ProtocolEvent::UpdateFundingIndex(e) => {
                let pair = self.instrument_mut(log.address).pair_mut(e.expiry);
                pair.long_funding_index = e.longFundingIndex;
                pair.short_funding_index = e.shortFundingIndex;
                pair.timestamp = block;
            }
            ProtocolEvent::UpdateSocialLossInsuranceIndex(e) => {
                let pair = self.instrument_mut(log.address).pair_mut(e.expiry);
                pair.long_social_loss_index = e.longSocialLossIndex;
                pair.short_social_loss_index = e.shortSocialLossIndex;
                pair.insurance_fund = e.insuranceFund;
                pair.timestamp = block;
            }
            ProtocolEvent::UpdateFeeState(e) => {
                let pair = self.instrument_mut(log.address).pair_mut(e.expiry);
                pair.fee_index = e.feeIndex;
                pair.protocol_fee = e.protocolFee;
                pair.timestamp = block;
            }

            // ─── Instrument: taker flow ───────────────────────────────────
            ProtocolEvent::Trade(e) => {
                let instrument = self.instrument_mut(log.address);
                let pair = instrument.pair_mut(e.expiry);
                pair.sqrt_p_x96 = e.sqrtPX96;
                pair.tick = e.tick;
                pair.open_interests = pair.open_interests.saturating_add(e.amount);
                if e.size.is_negative() {
                    pair.total_short = pair.total_short.saturating_add(e.size.unsigned_abs());
                } else {
                    pair.total_long = pair.total_long.saturating_add(e.size.unsigned_abs());
                }
                pair.timestamp = block;

                let (social, funding) = if e.size.is_negative() {
                    (pair.short_social_loss_index, pair.short_funding_index)
                } else {
                    (pair.long_social_loss_index, pair.long_funding_index)
                };
                let account = instrument.account_mut(e.trader, e.expiry);
                if account.position.size == I256::ZERO {
                    account.position.entry_social_loss_index = social;
                    account.position.entry_funding_index = funding;
                }
                account.position.size = account.position.size.saturating_add(e.size);
                account.position.entry_notional =
                    account.position.entry_notional.saturating_add(e.amount);
            }
            ProtocolEvent::Adjust(e) => {
                let account = self
                    .instrument_mut(log.address)
                    .account_mut(e.trader, e.expiry);
                if e.net.is_negative() {
                    account.position.balance =
                        account.position.balance.saturating_sub(e.net.unsigned_abs());
                } else {
                    account.position.balance =
                        account.position.balance.saturating_add(e.net.unsigned_abs());
                }
            }
            ProtocolEvent::Liquidate(e) => {
                let account = self
                    .instrument_mut(log.address)
                    .account_mut(e.trader, e.expiry);
                account.position.size = account.position.size.saturating_sub(e.size);
                account.position.balance = account.position.balance.saturating_sub(e.amount);
            }
            ProtocolEvent::Settle(e) => {
                let instrument = self.instrument_mut(log.address);
                let pair = instrument.pair_mut(e.expiry);
                pair.involved_fund = pair.involved_fund.saturating_sub(e.settlement);
                pair.timestamp = block;
                if let Some(by_expiry) = instrument.accounts.get_mut(&e.trader) {
                    by_expiry.remove(&e.expiry);
                    if by_expiry.is_empty() {
                        instrument.accounts.remove(&e.trader);
                    }
                }
            }

            // ─── Instrument: order book ───────────────────────────────────
            ProtocolEvent::Place(e) => {
                let account = self
                    .instrument_mut(log.address)
                    .account_mut(e.trader, e.expiry);
                account.orders.insert(
                    e.oid,
                    OrderState {
                        tick: e.tick,
                        size: e.size,
                        balance: e.balance,
                    },
                );
            }
            ProtocolEvent::Cancel(e) => {
                let account = self
                    .instrument_mut(log.address)
                    .account_mut(e.trader, e.expiry);
                if let Some(order) = account.orders.remove(&e.oid) {
                    let mut credited = order.balance.saturating_sub(e.fee);
                    credited = if e.pnl.is_negative() {
                        credited.saturating_sub(e.pnl.unsigned_abs())
                    } else {
                        credited.saturating_add(e.pnl.unsigned_abs())
                    };
                    account.position.balance =
                        account.position.balance.saturating_add(credited);
                }
            }
            ProtocolEvent::Fill(e) => {
                let account = self
                    .instrument_mut(log.address)
                    .account_mut(e.trader, e.expiry);
                if let Some(order) = account.orders.remove(&e.oid) {
                    let released = order
                        .balance
                        .saturating_sub(e.fee)
                        .saturating_sub(e.operatorFee);
                    account.position.size = account.position.size.saturating_add(e.size);
                    account.position.balance =
                        account.position.balance.saturating_add(released);
                }
            }

            // ─── Instrument: range liquidity ──────────────────────────────
            ProtocolEvent::Add(e) => {
                let instrument = self.instrument_mut(log.address);
                let pair = instrument.pair_mut(e.expiry);
                pair.liquidity = pair.liquidity.saturating_add(e.liquidity);
                pair.total_liquidity = pair.total_liquidity.saturating_add(e.liquidity);
                pair.timestamp = block;
                let account = instrument.account_mut(e.trader, e.expiry);
                account.ranges.insert(
                    e.rid,
                    RangeState {
                        tick_lower: e.tickLower,
                        tick_upper: e.tickUpper,
                        liquidity: e.liquidity,
                        balance: e.balance,
                        sqrt_entry_p_x96: e.sqrtEntryPX96,
                        entry_fee_index: e.entryFeeIndex,
                    },
                );
            }
            ProtocolEvent::Remove(e) => {
                let instrument = self.instrument_mut(log.address);
                let removed = instrument
                    .account_mut(e.trader, e.expiry)
                    .ranges
                    .remove(&e.rid);
                if let Some(range) = removed {
                    let pair = instrument.pair_mut(e.expiry);
                    pair.liquidity = pair.liquidity.saturating_sub(range.liquidity);
                    pair.total_liquidity = pair.total_liquidity.saturating_sub(range.liquidity);
                    pair.timestamp = block;
                    let mut credited = range.balance.saturating_sub(e.fee);
                    credited = if e.pnl.is_negative() {
                        credited.saturating_sub(e.pnl.unsigned_abs())
                    } else {
                        credited.saturating_add(e.pnl.unsigned_abs())
                    };
                    let account = instrument.account_mut(e.trader, e.expiry);
                    account.position.balance =
                        account.position.balance.saturating_add(credited);
                }
            }
        }
    }

    fn instrument_mut(&mut self, address: Address) -> &mut InstrumentState {
        self.instruments.entry(address).or_default()
    }

    /// The instrument at `address`, if present.
    #[must_use]
    pub fn instrument(&self, address: Address) -> Option<&InstrumentState> {
        self.instruments.get(&address)
    }

    /// Serialize for persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self).map_err(InfraError::Serialization)?)
    }

    /// Rebuild from persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match the snapshot shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value).map_err(InfraError::Serialization)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
