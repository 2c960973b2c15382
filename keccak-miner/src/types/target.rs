//! Difficulty target and difficulty.

use std::fmt;

use super::ParseError;
use crate::u256::U256;

/// A 256-bit threshold. A digest qualifies when, read as a big-endian
/// unsigned integer, it is strictly less than the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target(U256);

impl Target {
    /// The easiest possible target.
    pub const MAX: Self = Self(U256::MAX);

    pub const fn new(value: U256) -> Self {
        Self(value)
    }

    /// Parse an upstream target, given as hex with or without `0x` and with
    /// or without leading zeros.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        U256::from_hex(s).map(Self).map_err(ParseError::from)
    }

    /// Target for a difficulty: `(2^256 - 1) / difficulty`.
    pub fn from_difficulty(difficulty: Difficulty) -> Self {
        if difficulty.0 == U256::ZERO {
            return Self::MAX;
        }
        Self(U256::MAX / difficulty.0)
    }

    /// Most significant 64 bits, used by backends as a fast prefilter.
    pub fn high64(&self) -> u64 {
        self.0.high64()
    }

    /// Whether `digest` (big-endian) is strictly below this target.
    pub fn is_met_by(&self, digest: &[u8; 32]) -> bool {
        U256::from_be_bytes(*digest) < self.0
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Mining difficulty as reported by the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Difficulty(U256);

impl Difficulty {
    pub fn new(value: u64) -> Self {
        Self(U256::from(value))
    }

    pub fn from_u256(value: U256) -> Self {
        Self(value)
    }

    /// 64 uppercase hex digits, no prefix. This is the form submissions
    /// carry.
    pub fn to_hex_x64(&self) -> String {
        format!("{:X}", self.0)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values that fit in u64 print as decimal, larger ones as hex.
        if self.0 <= U256::from(u64::MAX) {
            write!(f, "{}", self.0.saturating_to_u64())
        } else {
            write!(f, "0x{:x}", self.0)
        }
    }
}
