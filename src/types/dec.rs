//! Serde helpers serializing 256-bit integers as decimal strings.
//!
//! The API and the persisted snapshot state both carry big numerics as
//! decimal strings (`"115792089..."`), never as JSON numbers or hex. Apply
//! with `#[serde(with = "crate::types::dec::u256")]` and the `i256` sibling.

/// Decimal-string serde for [`alloy::primitives::U256`].
pub mod u256 {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Serialize as a decimal string.
    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize from a decimal string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<U256>().map_err(D::Error::custom)
    }
}

/// Decimal-string serde for [`alloy::primitives::I256`].
pub mod i256 {
    use alloy::primitives::I256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Serialize as a decimal string (with sign).
    pub fn serialize<S: Serializer>(value: &I256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize from a decimal string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<I256, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<I256>().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{I256, U256};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(with = "super::u256")]
        unsigned: U256,
        #[serde(with = "super::i256")]
        signed: I256,
    }

    #[test]
    fn round_trips_as_decimal_strings() {
        let sample = Sample {
            unsigned: U256::from(123_456_789_000_000_000_000_u128),
            signed: I256::try_from(-42_000_000_000_000_i64).unwrap(),
        };

        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"123456789000000000000\""));
        assert!(json.contains("\"-42000000000000\""));

        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
    }
}
