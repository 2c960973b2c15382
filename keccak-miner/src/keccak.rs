//! Keccak-f[1600] lane primitives.
//!
//! The state is 25 little-endian 64-bit lanes, lane `x + 5*y`. The step
//! functions are exposed separately because the midstate path runs theta,
//! rho and pi of round 0 ahead of time and finishes the rest per nonce.

/// Permutation state.
pub type State = [u64; 25];

/// Number of rounds in Keccak-f[1600].
pub const ROUNDS: usize = 24;

/// Iota round constants.
pub const ROUND_CONSTANTS: [u64; ROUNDS] = [
    0x0000_0000_0000_0001,
    0x0000_0000_0000_8082,
    0x8000_0000_0000_808a,
    0x8000_0000_8000_8000,
    0x0000_0000_0000_808b,
    0x0000_0000_8000_0001,
    0x8000_0000_8000_8081,
    0x8000_0000_0000_8009,
    0x0000_0000_0000_008a,
    0x0000_0000_0000_0088,
    0x0000_0000_8000_8009,
    0x0000_0000_8000_000a,
    0x0000_0000_8000_808b,
    0x8000_0000_0000_008b,
    0x8000_0000_0000_8089,
    0x8000_0000_0000_8003,
    0x8000_0000_0000_8002,
    0x8000_0000_0000_0080,
    0x0000_0000_0000_800a,
    0x8000_0000_8000_000a,
    0x8000_0000_8000_8081,
    0x8000_0000_0000_8080,
    0x0000_0000_8000_0001,
    0x8000_0000_8000_8008,
];

/// Rho rotation offset of each lane, indexed `x + 5*y`.
pub const RHO: [u32; 25] = [
    0, 1, 62, 28, 27, //
    36, 44, 6, 55, 20, //
    3, 10, 43, 25, 39, //
    41, 45, 15, 21, 8, //
    18, 2, 61, 56, 14,
];

/// Pi destination of each lane: lane `x + 5*y` moves to `y + 5*((2x + 3y) % 5)`.
pub const PI: [usize; 25] = [
    0, 10, 20, 5, 15, //
    16, 1, 11, 21, 6, //
    7, 17, 2, 12, 22, //
    23, 8, 18, 3, 13, //
    14, 24, 9, 19, 4,
];

/// Column parities.
#[inline(always)]
pub fn columns(a: &State) -> [u64; 5] {
    let mut c = [0u64; 5];
    for (x, column) in c.iter_mut().enumerate() {
        *column = a[x] ^ a[x + 5] ^ a[x + 10] ^ a[x + 15] ^ a[x + 20];
    }
    c
}

/// Theta diffusion terms from column parities.
#[inline(always)]
pub fn theta_d(c: &[u64; 5]) -> [u64; 5] {
    let mut d = [0u64; 5];
    for (x, lane) in d.iter_mut().enumerate() {
        *lane = c[(x + 4) % 5] ^ c[(x + 1) % 5].rotate_left(1);
    }
    d
}

/// Theta step in place.
#[inline(always)]
pub fn theta(a: &mut State) {
    let d = theta_d(&columns(a));
    for (i, lane) in a.iter_mut().enumerate() {
        *lane ^= d[i % 5];
    }
}

/// Rho and pi steps.
#[inline(always)]
pub fn rho_pi(a: &State) -> State {
    let mut b = [0u64; 25];
    for i in 0..25 {
        b[PI[i]] = a[i].rotate_left(RHO[i]);
    }
    b
}

/// Chi and iota steps for round `round`, reading `b` and writing `a`.
#[inline(always)]
pub fn chi_iota(b: &State, a: &mut State, round: usize) {
    for y in 0..5 {
        let row = 5 * y;
        for x in 0..5 {
            a[row + x] = b[row + x] ^ (!b[row + (x + 1) % 5] & b[row + (x + 2) % 5]);
        }
    }
    a[0] ^= ROUND_CONSTANTS[round];
}

/// One full round.
#[inline(always)]
pub fn round(a: &mut State, round: usize) {
    theta(a);
    let b = rho_pi(a);
    chi_iota(&b, a, round);
}

/// Run rounds `first..ROUNDS` in place.
pub fn permute_from(a: &mut State, first: usize) {
    for r in first..ROUNDS {
        round(a, r);
    }
}

/// Full Keccak-f[1600].
pub fn permute(a: &mut State) {
    permute_from(a, 0);
}

/// First 32 bytes of the state, which is the Keccak-256 digest.
pub fn digest(a: &State) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (chunk, lane) in out.chunks_exact_mut(8).zip(a.iter()) {
        chunk.copy_from_slice(&lane.to_le_bytes());
    }
    out
}
