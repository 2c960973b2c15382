//! Solution templates and the 84-byte hashed message.
//!
//! The message is `challenge ‖ address ‖ template`. The template carries an
//! eight-byte nonce slot, which is the only field that varies while a
//! challenge is live. Normal mode puts the slot in the middle of the
//! template; king-making mode puts it right after a fixed 20-byte
//! beneficiary address at the start of the template.

use rand::RngCore;

use super::{
    Address, Challenge, ParseError, ADDRESS_LENGTH, CHALLENGE_LENGTH,
    MESSAGE_LENGTH, NONCE_LENGTH, TEMPLATE_LENGTH,
};

/// Where the nonce goes, and which target the backends compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiningMode {
    /// Nonce in the middle of the template; backends use the 64-bit target
    /// prefix.
    #[default]
    Normal,

    /// Nonce after the king address; backends use the full 256-bit target.
    KingMaking,
}

impl MiningMode {
    /// Byte offset of the nonce slot within the solution template.
    pub const fn nonce_offset(self) -> usize {
        match self {
            MiningMode::Normal => TEMPLATE_LENGTH / 2 - NONCE_LENGTH / 2,
            MiningMode::KingMaking => ADDRESS_LENGTH,
        }
    }

    /// Index of the little-endian 64-bit message word holding the nonce.
    pub const fn message_word(self) -> usize {
        (CHALLENGE_LENGTH + ADDRESS_LENGTH + self.nonce_offset()) / 8
    }
}

impl std::fmt::Display for MiningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MiningMode::Normal => write!(f, "normal"),
            MiningMode::KingMaking => write!(f, "king-making"),
        }
    }
}

/// 32-byte solution template with a zero-filled nonce slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolutionTemplate(pub [u8; TEMPLATE_LENGTH]);

impl SolutionTemplate {
    /// Generate a fresh template.
    ///
    /// Bytes outside the nonce slot are random so that separate miner
    /// processes search distinct message spaces. With a king address the
    /// template starts with that address and mining switches to king-making
    /// mode.
    pub fn generate(king: Option<&Address>) -> Self {
        let mut bytes = [0u8; TEMPLATE_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);

        let mode = match king {
            Some(address) => {
                bytes[..ADDRESS_LENGTH].copy_from_slice(address.as_bytes());
                MiningMode::KingMaking
            }
            None => MiningMode::Normal,
        };

        let offset = mode.nonce_offset();
        bytes[offset..offset + NONCE_LENGTH].fill(0);
        Self(bytes)
    }

    /// Copy of the template with `nonce` written little-endian into the slot.
    pub fn with_nonce(&self, mode: MiningMode, nonce: u64) -> [u8; TEMPLATE_LENGTH] {
        let mut bytes = self.0;
        let offset = mode.nonce_offset();
        bytes[offset..offset + NONCE_LENGTH].copy_from_slice(&nonce.to_le_bytes());
        bytes
    }

    pub fn as_bytes(&self) -> &[u8; TEMPLATE_LENGTH] {
        &self.0
    }
}

/// Challenge and address as announced upstream, before the template is
/// appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePrefix {
    pub challenge: Challenge,
    pub address: Address,
}

impl MessagePrefix {
    /// Parse a prefix hex string: 64 hex digits of challenge followed by 40
    /// hex digits of address. Anything after the address is ignored.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if let Some((index, c)) = digits.char_indices().find(|(_, c)| !c.is_ascii()) {
            return Err(ParseError::InvalidHex(hex::FromHexError::InvalidHexCharacter {
                c,
                index,
            }));
        }
        let challenge_digits = CHALLENGE_LENGTH * 2;
        let address_digits = ADDRESS_LENGTH * 2;

        if digits.len() < challenge_digits + address_digits {
            return Err(ParseError::InvalidLength {
                expected: CHALLENGE_LENGTH + ADDRESS_LENGTH,
                actual: digits.len() / 2,
            });
        }

        Ok(Self {
            challenge: Challenge::from_hex(&digits[..challenge_digits])?,
            address: Address::from_hex(
                &digits[challenge_digits..challenge_digits + address_digits],
            )?,
        })
    }
}

impl std::fmt::Display for MessagePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.challenge, hex::encode(self.address.as_bytes()))
    }
}

/// The full 84-byte message hashed with Keccak-256.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Message([u8; MESSAGE_LENGTH]);

impl Message {
    pub fn new(challenge: &Challenge, address: &Address, template: &[u8; TEMPLATE_LENGTH]) -> Self {
        let mut bytes = [0u8; MESSAGE_LENGTH];
        bytes[..CHALLENGE_LENGTH].copy_from_slice(challenge.as_bytes());
        bytes[CHALLENGE_LENGTH..CHALLENGE_LENGTH + ADDRESS_LENGTH]
            .copy_from_slice(address.as_bytes());
        bytes[CHALLENGE_LENGTH + ADDRESS_LENGTH..].copy_from_slice(template);
        Self(bytes)
    }

    /// Message with `nonce` placed at the slot for `mode`.
    pub fn with_nonce(
        challenge: &Challenge,
        address: &Address,
        template: &SolutionTemplate,
        mode: MiningMode,
        nonce: u64,
    ) -> Self {
        Self::new(challenge, address, &template.with_nonce(mode, nonce))
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_LENGTH] {
        &self.0
    }

    /// The message as eleven little-endian 64-bit words. The last word holds
    /// only the final four message bytes.
    pub fn words(&self) -> [u64; 11] {
        let mut words = [0u64; 11];
        for (i, word) in words.iter_mut().enumerate() {
            let mut lane = [0u8; 8];
            let start = i * 8;
            let end = (start + 8).min(MESSAGE_LENGTH);
            lane[..end - start].copy_from_slice(&self.0[start..end]);
            *word = u64::from_le_bytes(lane);
        }
        words
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message(0x{})", hex::encode(self.0))
    }
}
