//! Exact block heights.
//!
//! Some networks report heights wider than 64 bits, so heights are carried as
//! 256-bit integers and never pass through floating point.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A block height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNumber(U256);

/// Returned when a height string is neither decimal nor `0x` hex.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid block number '{0}'")]
pub struct ParseBlockNumberError(String);

impl BlockNumber {
    pub const ZERO: Self = Self(U256::ZERO);

    pub const fn new(value: U256) -> Self {
        Self(value)
    }

    pub const fn as_u256(&self) -> U256 {
        self.0
    }

    /// Returns the height as `u64` if it fits.
    pub fn to_u64(&self) -> Option<u64> {
        let limbs = self.0.as_limbs();
        if limbs[1..].iter().all(|l| *l == 0) {
            Some(limbs[0])
        } else {
            None
        }
    }
}

impl From<u64> for BlockNumber {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<U256> for BlockNumber {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl FromStr for BlockNumber {
    type Err = ParseBlockNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) if !hex.is_empty() => U256::from_str_radix(hex, 16),
            Some(_) => return Err(ParseBlockNumberError(s.to_string())),
            None if !trimmed.is_empty() => U256::from_str_radix(trimmed, 10),
            None => return Err(ParseBlockNumberError(s.to_string())),
        };
        parsed
            .map(Self)
            .map_err(|_| ParseBlockNumberError(s.to_string()))
    }
}

/// Canonical decimal form; this is also the persisted representation.
impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for BlockNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_u64() {
            Some(n) => serializer.serialize_u64(n),
            None => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for BlockNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(Self::from(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!("42".parse::<BlockNumber>().unwrap(), BlockNumber::from(42u64));
        assert_eq!("0x2a".parse::<BlockNumber>().unwrap(), BlockNumber::from(42u64));
        assert_eq!(" 0X2A ".parse::<BlockNumber>().unwrap(), BlockNumber::from(42u64));
        assert!("".parse::<BlockNumber>().is_err());
        assert!("0x".parse::<BlockNumber>().is_err());
        assert!("12.5".parse::<BlockNumber>().is_err());
        assert!("-1".parse::<BlockNumber>().is_err());
    }

    #[test]
    fn heights_beyond_u64_stay_exact() {
        // 2^64 and 2^64 + 1 collapse to the same f64; they must not collapse here.
        let a: BlockNumber = "18446744073709551616".parse().unwrap();
        let b: BlockNumber = "18446744073709551617".parse().unwrap();
        assert!(a < b);
        assert_ne!(a, b);
        assert_eq!(a.to_u64(), None);
        assert_eq!(b.to_string(), "18446744073709551617");
    }

    #[test]
    fn json_forms() {
        let small: BlockNumber = serde_json::from_str("7").unwrap();
        assert_eq!(small, BlockNumber::from(7u64));
        assert_eq!(serde_json::to_string(&small).unwrap(), "7");

        let big: BlockNumber = serde_json::from_str("\"18446744073709551616\"").unwrap();
        assert_eq!(
            serde_json::to_string(&big).unwrap(),
            "\"18446744073709551616\""
        );

        let hex: BlockNumber = serde_json::from_str("\"0x10\"").unwrap();
        assert_eq!(hex, BlockNumber::from(16u64));

        assert!(serde_json::from_str::<BlockNumber>("\"nope\"").is_err());
        assert!(serde_json::from_str::<BlockNumber>("1.5").is_err());
    }
}
