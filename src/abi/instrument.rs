//! ABI bindings for Instrument contract events.
//!
//! Each Instrument is one derivatives market, created by the Gate and
//! discovered at runtime. A market hosts one AMM pair per expiry
//! (`4294967295` = perpetual) plus trader accounts holding a position,
//! limit orders, and liquidity ranges.
//!
//! Event groups:
//! - AMM lifecycle: `UpdateAmmStatus`, `UpdateFundingIndex`,
//!   `UpdateSocialLossInsuranceIndex`, `UpdateFeeState`
//! - Taker flow: `Trade`, `Adjust`, `Liquidate`, `Settle`
//! - Order book: `Place`, `Cancel`, `Fill`
//! - Range liquidity: `Add`, `Remove`

use alloy::sol;

sol! {
    /// Emitted when a pair's AMM status changes.
    ///
    /// `status`: 0 = Dormant, 1 = Trading, 2 = Settling, 3 = Settled.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event UpdateAmmStatus(
        uint32 indexed expiry,
        uint8 status,
        uint256 sqrtPX96,
        int32 tick
    );

    /// Emitted on every taker trade against the AMM.
    ///
    /// # Data Fields
    /// - `size`: Signed base size (positive = long)
    /// - `amount`: Quote notional moved
    /// - `sqrtPX96` / `tick`: Post-trade AMM price
    /// - `feeRatio`: Fee ratio charged, basis points scaled by 1e14
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Trade(
        address indexed trader,
        uint32 indexed expiry,
        int256 size,
        uint256 amount,
        uint256 sqrtPX96,
        int32 tick,
        uint256 feeRatio
    );

    /// Emitted when a trader adds or removes position margin.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Adjust(
        address indexed trader,
        uint32 indexed expiry,
        int256 net
    );

    /// Emitted when a liquidity range is opened.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Add(
        address indexed trader,
        uint32 indexed expiry,
        uint32 indexed rid,
        int32 tickLower,
        int32 tickUpper,
        uint256 liquidity,
        uint256 balance,
        uint256 sqrtEntryPX96,
        uint256 entryFeeIndex
    );

    /// Emitted when a liquidity range is closed.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Remove(
        address indexed trader,
        uint32 indexed expiry,
        uint32 indexed rid,
        uint256 fee,
        int256 pnl,
        address operator
    );

    /// Emitted when a limit order is placed at a tick.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Place(
        address indexed trader,
        uint32 indexed expiry,
        uint32 indexed oid,
        int32 tick,
        int256 size,
        uint256 balance
    );

    /// Emitted when an unfilled order is cancelled.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Cancel(
        address indexed trader,
        uint32 indexed oid,
        uint32 expiry,
        uint256 fee,
        int256 pnl
    );

    /// Emitted when a resting order is filled against the AMM.
    ///
    /// This is the event fanned out to MQ subscribers (`subscribeOrderFilled`).
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Fill(
        address indexed trader,
        uint32 indexed expiry,
        uint32 indexed oid,
        int256 size,
        uint256 fee,
        uint256 operatorFee
    );

    /// Emitted when an under-margined position is liquidated.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Liquidate(
        address indexed trader,
        uint32 indexed expiry,
        address indexed by,
        uint256 amount,
        int256 size
    );

    /// Emitted when an account is settled and its balance released.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Settle(
        address indexed trader,
        uint32 indexed expiry,
        uint256 settlement,
        uint256 balance,
        address operator
    );

    /// Emitted when the pair's funding indexes accrue.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event UpdateFundingIndex(
        uint32 indexed expiry,
        int256 longFundingIndex,
        int256 shortFundingIndex
    );

    /// Emitted when social loss indexes or the insurance fund change.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event UpdateSocialLossInsuranceIndex(
        uint32 indexed expiry,
        uint256 longSocialLossIndex,
        uint256 shortSocialLossIndex,
        uint256 insuranceFund
    );

    /// Emitted when the pair's fee accumulators change.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event UpdateFeeState(
        uint32 indexed expiry,
        uint256 feeIndex,
        uint256 protocolFee
    );
}
