//! Core swap types shared by the escrow engine, pricing and coordination
//!
//! - `Secret` / `Hashlock`: the HTLC preimage and its keccak256 commitment
//! - `Timelocks`: seven timelock stages packed into one 256-bit word
//! - `Intent` / `Immutables` / `Order`: the swap request and its committed form

pub mod order;
pub mod secret;
pub mod timelocks;

pub use order::{EscrowSide, Immutables, Intent, Order, OrderStatus};
pub use secret::{keccak256, Hashlock, Secret};
pub use timelocks::{Stage, StageOffsets, Timelocks};

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Serde adapter for U256 amounts as decimal strings.
///
/// Accepts decimal strings, `0x` hex strings and plain JSON integers on input.
pub mod u256_dec {
    use ethers::types::U256;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(U256::from(n)),
            Raw::Str(s) => parse(&s).map_err(D::Error::custom),
        }
    }

    /// Parse a decimal or `0x`-prefixed hex amount
    pub fn parse(s: &str) -> Result<U256, String> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x") {
            U256::from_str_radix(hex, 16).map_err(|e| format!("invalid hex amount {}: {}", s, e))
        } else {
            U256::from_dec_str(s).map_err(|e| format!("invalid amount {}: {}", s, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "u256_dec")]
        amount: U256,
    }

    #[test]
    fn test_u256_decimal_serde() {
        let w: Wrapper = serde_json::from_str(r#"{"amount":"1000000000000000000"}"#).unwrap();
        assert_eq!(w.amount, U256::exp10(18));

        let w: Wrapper = serde_json::from_str(r#"{"amount":"0xff"}"#).unwrap();
        assert_eq!(w.amount, U256::from(255));

        let w: Wrapper = serde_json::from_str(r#"{"amount":42}"#).unwrap();
        assert_eq!(serde_json::to_string(&w).unwrap(), r#"{"amount":"42"}"#);
    }

    #[test]
    fn test_rejects_garbage_amount() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"amount":"ten"}"#).is_err());
    }
}
