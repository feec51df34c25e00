//! ABI bindings for the Config contract events.
//!
//! Config carries protocol-wide parameters: per-quote fee ratios and the
//! registry of market implementations.

use alloy::sol;

sol! {
    /// Emitted when fee parameters for a quote token change.
    ///
    /// Ratios are expressed in basis points.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event SetQuoteParam(
        address indexed quote,
        uint16 tradingFeeRatio,
        uint16 protocolFeeRatio
    );

    /// Emitted when a market implementation is registered or replaced.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event SetMarketInfo(
        bytes32 indexed marketType,
        address market,
        address beacon
    );
}
