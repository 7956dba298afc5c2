//! Row hashing for the sketch.
//!
//! Every row owns a 64-bit seed. A key is mapped to a column of that row with
//! a multiply-shift mix whose arithmetic wraps modulo 2^64, so the result only
//! depends on the bit pattern of `(key, seed, width)` and is stable across
//! processes and platforms.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

// Golden-ratio constant, used to derive the row multiplier.
const MULTIPLIER_MIX: u64 = 0x9E37_79B9_7F4A_7C15;
// SplitMix64 constant, used to whiten the key.
const KEY_MIX: u64 = 0xBF58_476D_1CE4_E5B9;

/// Maps `key` to a column in `[0, width)` for the row seeded with `seed`.
///
/// `width` must be non-zero.
#[inline]
pub fn multiply_shift(key: u64, seed: u64, width: usize) -> usize {
    // An odd multiplier keeps the product a bijection of the mixed key.
    let a = seed.wrapping_mul(MULTIPLIER_MIX) | 1;
    let x = key ^ seed.wrapping_mul(KEY_MIX);
    let z = a.wrapping_mul(x);

    (((z >> 32) ^ (z & 0xFFFF_FFFF)) % width as u64) as usize
}

/// Draws `count` row seeds from a ChaCha stream keyed by `seed`.
pub fn row_seeds(count: usize, seed: u64) -> Vec<u64> {
    let mut rng = ChaChaRng::seed_from_u64(seed);

    (0..count).map(|_| rng.gen::<u64>()).collect()
}
