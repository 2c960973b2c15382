//! Midstate precomputation.
//!
//! The 84-byte message fits inside one 136-byte Keccak-256 rate block, so
//! the whole absorb phase is a single XOR into a zero state followed by the
//! permutation. Everything in round 0 up to and including pi depends on the
//! message only through the nonce word, which makes it worth computing once
//! per challenge and sharing with every device. Hash kernels consume this
//! layout directly, so the lane order and rotation offsets are fixed.
//!
//! Padding is folded into constants: the `0x01` pad byte lands at message
//! byte 84, which is bit 32 of word 10, and the final `0x80` bit of the
//! block is the top bit of lane 16.

use crate::keccak::{self, State, PI, RHO};
use crate::types::{Address, Challenge, Message, SolutionTemplate};

/// Length of a serialized midstate in bytes.
pub const MID_STATE_LENGTH: usize = 200;

const PAD_WORD_10: u64 = 0x0000_0001_0000_0000;
const PAD_LANE_16: u64 = 0x8000_0000_0000_0000;

/// Keccak state after theta, rho and pi of round 0, for a message whose
/// nonce slot holds its template value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MidState(State);

impl MidState {
    pub fn lanes(&self) -> &State {
        &self.0
    }

    pub fn from_lanes(lanes: State) -> Self {
        Self(lanes)
    }

    /// The 25 lanes as 200 little-endian bytes, the layout backends upload.
    pub fn to_bytes(&self) -> [u8; MID_STATE_LENGTH] {
        let mut out = [0u8; MID_STATE_LENGTH];
        for (chunk, lane) in out.chunks_exact_mut(8).zip(self.0.iter()) {
            chunk.copy_from_slice(&lane.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; MID_STATE_LENGTH]) -> Self {
        let mut lanes = [0u64; 25];
        for (lane, chunk) in lanes.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *lane = u64::from_le_bytes(word);
        }
        Self(lanes)
    }
}

impl std::fmt::Debug for MidState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MidState(0x{})", hex::encode(self.to_bytes()))
    }
}

/// Compute the midstate for `challenge ‖ address ‖ template`.
pub fn compute_mid_state(
    challenge: &Challenge,
    address: &Address,
    template: &SolutionTemplate,
) -> MidState {
    mid_state_from_message(&Message::new(challenge, address, template.as_bytes()))
}

/// Compute the midstate of an already assembled message.
pub fn mid_state_from_message(message: &Message) -> MidState {
    let m = message.words();

    let c = [
        m[0] ^ m[5] ^ m[10] ^ PAD_WORD_10,
        m[1] ^ m[6] ^ PAD_LANE_16,
        m[2] ^ m[7],
        m[3] ^ m[8],
        m[4] ^ m[9],
    ];

    let d = [
        c[1].rotate_left(1) ^ c[4],
        c[2].rotate_left(1) ^ c[0],
        c[3].rotate_left(1) ^ c[1],
        c[4].rotate_left(1) ^ c[2],
        c[0].rotate_left(1) ^ c[3],
    ];

    MidState([
        m[0] ^ d[0],
        (m[6] ^ d[1]).rotate_left(44),
        d[2].rotate_left(43),
        d[3].rotate_left(21),
        d[4].rotate_left(14),
        (m[3] ^ d[3]).rotate_left(28),
        (m[9] ^ d[4]).rotate_left(20),
        (m[10] ^ d[0] ^ PAD_WORD_10).rotate_left(3),
        (PAD_LANE_16 ^ d[1]).rotate_left(45),
        d[2].rotate_left(61),
        (m[1] ^ d[1]).rotate_left(1),
        (m[7] ^ d[2]).rotate_left(6),
        d[3].rotate_left(25),
        d[4].rotate_left(8),
        d[0].rotate_left(18),
        (m[4] ^ d[4]).rotate_left(27),
        (m[5] ^ d[0]).rotate_left(36),
        d[1].rotate_left(10),
        d[2].rotate_left(15),
        d[3].rotate_left(56),
        (m[2] ^ d[2]).rotate_left(62),
        (m[8] ^ d[3]).rotate_left(55),
        d[4].rotate_left(39),
        d[0].rotate_left(41),
        d[1].rotate_left(2),
    ])
}

/// Finish the Keccak-256 hash of the message behind `mid` with `nonce`
/// XORed into message word `word`.
///
/// `mid` must have been computed with a zero nonce slot. The nonce changes
/// one column parity, so round 0 is patched by pushing that change through
/// theta, rho and pi before running chi, iota and the remaining rounds.
pub fn finish_with_nonce(mid: &MidState, word: usize, nonce: u64) -> [u8; 32] {
    let x = word % 5;
    let mut delta = [0u64; 25];

    delta[word] ^= nonce;
    let left = nonce.rotate_left(1);
    for y in 0..5 {
        delta[(x + 4) % 5 + 5 * y] ^= left;
        delta[(x + 1) % 5 + 5 * y] ^= nonce;
    }

    let mut b = mid.0;
    for (i, d) in delta.iter().enumerate() {
        if *d != 0 {
            b[PI[i]] ^= d.rotate_left(RHO[i]);
        }
    }

    let mut a = [0u64; 25];
    keccak::chi_iota(&b, &mut a, 0);
    keccak::permute_from(&mut a, 1);
    keccak::digest(&a)
}
