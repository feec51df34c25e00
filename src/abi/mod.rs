//! ABI bindings and unified decoding for OBELISK contracts.
//!
//! Three interfaces cover the whole protocol:
//!
//! | Contract | Module | Events | Description |
//! |----------|--------|--------|-------------|
//! | `Gate` | [`gate`] | 5 | Custody, instrument factory |
//! | `Config` | [`config`] | 2 | Protocol parameters |
//! | `Instrument` | [`instrument`] | 13 | Per-market AMM, orders, ranges |
//!
//! Raw logs are decoded against the interface selected by their emitting
//! address ([`ContractKind`]); the result is the unified [`ProtocolEvent`]
//! enum. Decoding failures are non-fatal upstream - the caller warns and
//! skips the log.

pub mod config;
pub mod gate;
pub mod instrument;

use alloy::primitives::Log as PrimitiveLog;
use alloy::sol_types::SolEvent;
use serde::{Deserialize, Serialize};

use crate::error::{InfraError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// CONTRACT KIND
// ═══════════════════════════════════════════════════════════════════════════════

/// Which ABI interface an address is decoded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    /// The central Gate contract.
    Gate,
    /// The Config contract.
    Config,
    /// A dynamically discovered Instrument market.
    Instrument,
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNIFIED EVENT ENUM
// ═══════════════════════════════════════════════════════════════════════════════

/// Unified enum over every decoded OBELISK event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ProtocolEvent {
    // Gate
    /// A new instrument market was deployed.
    NewInstrument(gate::NewInstrument),
    /// Collateral deposited into the Gate.
    Deposit(gate::Deposit),
    /// Collateral withdrawn from the Gate.
    Withdraw(gate::Withdraw),
    /// Collateral pulled into an instrument.
    Gather(gate::Gather),
    /// Collateral returned to Gate custody.
    Scatter(gate::Scatter),

    // Config
    /// Fee parameters changed for a quote token.
    SetQuoteParam(config::SetQuoteParam),
    /// Market implementation registered.
    SetMarketInfo(config::SetMarketInfo),

    // Instrument
    /// AMM status transition.
    UpdateAmmStatus(instrument::UpdateAmmStatus),
    /// Taker trade.
    Trade(instrument::Trade),
    /// Margin adjustment.
    Adjust(instrument::Adjust),
    /// Liquidity range opened.
    Add(instrument::Add),
    /// Liquidity range closed.
    Remove(instrument::Remove),
    /// Limit order placed.
    Place(instrument::Place),
    /// Limit order cancelled.
    Cancel(instrument::Cancel),
    /// Limit order filled.
    Fill(instrument::Fill),
    /// Position liquidated.
    Liquidate(instrument::Liquidate),
    /// Account settled.
    Settle(instrument::Settle),
    /// Funding indexes accrued.
    UpdateFundingIndex(instrument::UpdateFundingIndex),
    /// Social loss / insurance fund update.
    UpdateSocialLossInsuranceIndex(instrument::UpdateSocialLossInsuranceIndex),
    /// Fee accumulators update.
    UpdateFeeState(instrument::UpdateFeeState),
}

impl ProtocolEvent {
    /// The event's on-chain name (used as the stored-event name and the
    /// handler dispatch key).
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NewInstrument(_) => "NewInstrument",
            Self::Deposit(_) => "Deposit",
            Self::Withdraw(_) => "Withdraw",
            Self::Gather(_) => "Gather",
            Self::Scatter(_) => "Scatter",
            Self::SetQuoteParam(_) => "SetQuoteParam",
            Self::SetMarketInfo(_) => "SetMarketInfo",
            Self::UpdateAmmStatus(_) => "UpdateAmmStatus",
            Self::Trade(_) => "Trade",
            Self::Adjust(_) => "Adjust",
            Self::Add(_) => "Add",
            Self::Remove(_) => "Remove",
            Self::Place(_) => "Place",
            Self::Cancel(_) => "Cancel",
            Self::Fill(_) => "Fill",
            Self::Liquidate(_) => "Liquidate",
            Self::Settle(_) => "Settle",
            Self::UpdateFundingIndex(_) => "UpdateFundingIndex",
            Self::UpdateSocialLossInsuranceIndex(_) => "UpdateSocialLossInsuranceIndex",
            Self::UpdateFeeState(_) => "UpdateFeeState",
        }
    }

    /// Decode a raw log against the interface for `kind`.
    ///
    /// Returns `Ok(None)` when topic0 does not belong to that interface
    /// (foreign event on a watched address - not an error).
    ///
    /// # Errors
    ///
    /// Returns an error when topic0 matches but the body fails to decode.
    pub fn decode(kind: ContractKind, log: &PrimitiveLog) -> Result<Option<Self>> {
        let Some(topic0) = log.topics().first() else {
            return Ok(None);
        };

        let event = match kind {
            ContractKind::Gate => match topic0.as_slice() {
                x if x == gate::NewInstrument::SIGNATURE_HASH.as_slice() => {
                    Self::NewInstrument(decode_event::<gate::NewInstrument>(log)?)
                }
                x if x == gate::Deposit::SIGNATURE_HASH.as_slice() => {
                    Self::Deposit(decode_event::<gate::Deposit>(log)?)
                }
                x if x == gate::Withdraw::SIGNATURE_HASH.as_slice() => {
                    Self::Withdraw(decode_event::<gate::Withdraw>(log)?)
                }
                x if x == gate::Gather::SIGNATURE_HASH.as_slice() => {
                    Self::Gather(decode_event::<gate::Gather>(log)?)
                }
                x if x == gate::Scatter::SIGNATURE_HASH.as_slice() => {
                    Self::Scatter(decode_event::<gate::Scatter>(log)?)
                }
                _ => return Ok(None),
            },
            ContractKind::Config => match topic0.as_slice() {
                x if x == config::SetQuoteParam::SIGNATURE_HASH.as_slice() => {
                    Self::SetQuoteParam(decode_event::<config::SetQuoteParam>(log)?)
                }
                x if x == config::SetMarketInfo::SIGNATURE_HASH.as_slice() => {
                    Self::SetMarketInfo(decode_event::<config::SetMarketInfo>(log)?)
                }
                _ => return Ok(None),
            },
            ContractKind::Instrument => match topic0.as_slice() {
                x if x == instrument::UpdateAmmStatus::SIGNATURE_HASH.as_slice() => {
                    Self::UpdateAmmStatus(decode_event::<instrument::UpdateAmmStatus>(log)?)
                }
                x if x == instrument::Trade::SIGNATURE_HASH.as_slice() => {
                    Self::Trade(decode_event::<instrument::Trade>(log)?)
                }
                x if x == instrument::Adjust::SIGNATURE_HASH.as_slice() => {
                    Self::Adjust(decode_event::<instrument::Adjust>(log)?)
                }
                x if x == instrument::Add::SIGNATURE_HASH.as_slice() => {
                    Self::Add(decode_event::<instrument::Add>(log)?)
                }
                x if x == instrument::Remove::SIGNATURE_HASH.as_slice() => {
                    Self::Remove(decode_event::<instrument::Remove>(log)?)
                }
                x if x == instrument::Place::SIGNATURE_HASH.as_slice() => {
                    Self::Place(decode_event::<instrument::Place>(log)?)
                }
                x if x == instrument::Cancel::SIGNATURE_HASH.as_slice() => {
                    Self::Cancel(decode_event::<instrument::Cancel>(log)?)
                }
                x if x == instrument::Fill::SIGNATURE_HASH.as_slice() => {
                    Self::Fill(decode_event::<instrument::Fill>(log)?)
                }
                x if x == instrument::Liquidate::SIGNATURE_HASH.as_slice() => {
                    Self::Liquidate(decode_event::<instrument::Liquidate>(log)?)
                }
                x if x == instrument::Settle::SIGNATURE_HASH.as_slice() => {
                    Self::Settle(decode_event::<instrument::Settle>(log)?)
                }
                x if x == instrument::UpdateFundingIndex::SIGNATURE_HASH.as_slice() => {
                    Self::UpdateFundingIndex(decode_event::<instrument::UpdateFundingIndex>(log)?)
                }
                x if x
                    == instrument::UpdateSocialLossInsuranceIndex::SIGNATURE_HASH.as_slice() =>
                {
                    Self::UpdateSocialLossInsuranceIndex(decode_event::<
                        instrument::UpdateSocialLossInsuranceIndex,
                    >(log)?)
                }
                x if x == instrument::UpdateFeeState::SIGNATURE_HASH.as_slice() => {
                    Self::UpdateFeeState(decode_event::<instrument::UpdateFeeState>(log)?)
                }
                _ => return Ok(None),
            },
        };

        Ok(Some(event))
    }

    /// Serialize the decoded arguments for persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (should not happen for these
    /// types).
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self).map_err(InfraError::Serialization)?)
    }

    /// Rebuild an event from a stored `(name, payload)` pair.
    ///
    /// Used by replay paths that bypass re-decoding the raw log.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown name or a payload that does not match
    /// the named event's shape.
    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload).map_err(InfraError::Serialization)?)
    }
}

/// Decode a log into a strongly-typed event.
fn decode_event<Ev: SolEvent>(log: &PrimitiveLog) -> Result<Ev> {
    let decoded = Ev::decode_log(log).map_err(|e| {
        InfraError::EventDecoding(format!("failed to decode {}: {e}", Ev::SIGNATURE))
    })?;
    Ok(decoded.data)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, U256};
    use alloy::sol_types::SolEvent;

    use super::*;

    /// Verify that all event signature hashes are unique (no collisions).
    #[test]
    fn event_signatures_are_unique() {
        let signatures = [
            gate::NewInstrument::SIGNATURE_HASH,
            gate::Deposit::SIGNATURE_HASH,
            gate::Withdraw::SIGNATURE_HASH,
            gate::Gather::SIGNATURE_HASH,
            gate::Scatter::SIGNATURE_HASH,
            config::SetQuoteParam::SIGNATURE_HASH,
            config::SetMarketInfo::SIGNATURE_HASH,
            instrument::UpdateAmmStatus::SIGNATURE_HASH,
            instrument::Trade::SIGNATURE_HASH,
            instrument::Adjust::SIGNATURE_HASH,
            instrument::Add::SIGNATURE_HASH,
            instrument::Remove::SIGNATURE_HASH,
            instrument::Place::SIGNATURE_HASH,
            instrument::Cancel::SIGNATURE_HASH,
            instrument::Fill::SIGNATURE_HASH,
            instrument::Liquidate::SIGNATURE_HASH,
            instrument::Settle::SIGNATURE_HASH,
            instrument::UpdateFundingIndex::SIGNATURE_HASH,
            instrument::UpdateSocialLossInsuranceIndex::SIGNATURE_HASH,
            instrument::UpdateFeeState::SIGNATURE_HASH,
        ];

        let mut seen = std::collections::HashSet::new();
        for sig in signatures {
            assert!(seen.insert(sig), "duplicate event signature hash: {sig:?}");
        }
        assert_eq!(seen.len(), 20, "expected 20 unique event signatures");
    }

    #[test]
    fn decode_routes_by_contract_kind() {
        let event = gate::Deposit {
            quote: Address::repeat_byte(0x01),
            trader: Address::repeat_byte(0x02),
            quantity: U256::from(1000u64),
        };
        let raw = alloy::primitives::Log::new_unchecked(
            Address::repeat_byte(0xAA),
            event.encode_topics().into_iter().map(|t| t.0).collect(),
            event.encode_data().into(),
        );

        // Decodes against the Gate interface.
        let decoded = ProtocolEvent::decode(ContractKind::Gate, &raw).unwrap();
        assert!(matches!(decoded, Some(ProtocolEvent::Deposit(d)) if d == event));

        // A Gate event is foreign to the Instrument interface.
        let foreign = ProtocolEvent::decode(ContractKind::Instrument, &raw).unwrap();
        assert!(foreign.is_none());
    }

    #[test]
    fn payload_round_trip() {
        let event = ProtocolEvent::Deposit(gate::Deposit {
            quote: Address::repeat_byte(0x01),
            trader: Address::repeat_byte(0x02),
            quantity: U256::from(42u64),
        });

        let payload = event.to_payload().unwrap();
        let back = ProtocolEvent::from_payload(payload).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.name(), "Deposit");
    }
}
