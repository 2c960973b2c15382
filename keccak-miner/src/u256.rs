//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` so targets, digests and difficulties share one
//! comparison-friendly type. Digests and targets travel as big-endian bytes
//! (the Solidity `uint256` view of a Keccak digest), so the byte conversions
//! here are big-endian first.

use ruint::aliases::U256 as Ruint256;
use std::fmt;
use std::ops::Div;

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// Largest representable value, `2^256 - 1`.
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Create from big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    /// Convert to big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Most significant 64 bits.
    pub fn high64(self) -> u64 {
        self.0.as_limbs()[3]
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn saturating_to_u64(self) -> u64 {
        self.0.saturating_to()
    }

    /// Parse a hex string of up to 64 digits, with or without `0x`.
    ///
    /// Shorter strings are left-padded with zeros, matching how big integers
    /// arrive from upstream without leading zeros.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        if digits.len() > 64 {
            return Err(hex::FromHexError::InvalidStringLength);
        }

        let padded = format!("{:0>64}", digits);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(padded, &mut bytes)?;
        Ok(Self::from_be_bytes(bytes))
    }

    /// 64 lowercase hex digits, no prefix.
    pub fn to_hex(self) -> String {
        hex::encode(self.to_be_bytes())
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Ruint256::from(value))
    }
}

impl Div for U256 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(self.0 / rhs.0)
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

impl fmt::UpperHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.to_be_bytes()))
    }
}

impl fmt::LowerHex for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
