//! ABI bindings for the Gate contract events.
//!
//! The Gate is the protocol's central custody and factory contract:
//! - Creates `Instrument` markets (`NewInstrument`) - the discovery signal
//!   the ingestor watches for
//! - Holds trader collateral (`Deposit` / `Withdraw`)
//! - Moves collateral between custody and instruments (`Gather` / `Scatter`)

use alloy::sol;

sol! {
    /// Emitted when the Gate deploys a new Instrument market.
    ///
    /// # Indexed Fields
    /// - `instrument`: Address of the freshly deployed market
    /// - `index`: Market index key (base/quote identifier)
    ///
    /// # Data Fields
    /// - `symbol`: Human-readable market symbol (e.g. "ETH-USDB-PERP")
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event NewInstrument(
        address indexed instrument,
        bytes32 indexed index,
        string symbol
    );

    /// Emitted when a trader deposits quote collateral into the Gate.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Deposit(
        address indexed quote,
        address indexed trader,
        uint256 quantity
    );

    /// Emitted when a trader withdraws quote collateral from the Gate.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Withdraw(
        address indexed quote,
        address indexed trader,
        uint256 quantity
    );

    /// Emitted when the Gate pulls trader collateral into an instrument.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Gather(
        address indexed trader,
        address indexed instrument,
        uint32 expiry,
        uint256 quantity
    );

    /// Emitted when an instrument returns collateral to Gate custody.
    #[derive(Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    event Scatter(
        address indexed trader,
        address indexed instrument,
        uint32 expiry,
        uint256 quantity
    );
}
