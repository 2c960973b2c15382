//! Core types for keccak-miner.
//!
//! This module provides a unified location for the fixed-length values that
//! make up a mining job (challenge, address, solution template), the 84-byte
//! message built from them, targets and difficulty, and hashrate.

mod hash_rate;
mod message;
mod target;

pub use hash_rate::HashRate;
pub use message::{Message, MessagePrefix, MiningMode, SolutionTemplate};
pub use target::{Difficulty, Target};

/// Length of a challenge in bytes.
pub const CHALLENGE_LENGTH: usize = 32;

/// Length of a miner address in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a solution template in bytes.
pub const TEMPLATE_LENGTH: usize = 32;

/// Length of a nonce in bytes.
pub const NONCE_LENGTH: usize = 8;

/// Length of the hashed message: challenge, address, then template.
pub const MESSAGE_LENGTH: usize = CHALLENGE_LENGTH + ADDRESS_LENGTH + TEMPLATE_LENGTH;

/// Errors from parsing hex-encoded inputs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Decode `0x`-optional hex into exactly `N` bytes.
pub(crate) fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

/// A 32-byte puzzle instance published upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Challenge(pub [u8; CHALLENGE_LENGTH]);

impl Challenge {
    /// Parse from hex, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        decode_fixed(s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LENGTH] {
        &self.0
    }
}

impl std::fmt::Display for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A 20-byte account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    /// Parse from hex, with or without `0x`.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        decode_fixed(s).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_hex_roundtrip_with_prefix() {
        let hex = format!("0x{}", "ab".repeat(32));
        let challenge = Challenge::from_hex(&hex).unwrap();
        assert_eq!(challenge.0, [0xab; 32]);
        assert_eq!(challenge.to_string(), hex);
    }

    #[test]
    fn test_address_rejects_wrong_length() {
        let err = Address::from_hex(&"11".repeat(19)).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidLength {
                expected: 20,
                actual: 19
            }
        );
    }

    #[test]
    fn test_address_rejects_non_hex() {
        assert!(matches!(
            Address::from_hex(&"zz".repeat(20)),
            Err(ParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_message_length() {
        assert_eq!(MESSAGE_LENGTH, 84);
    }
}
