//! # Per-Thread Random Source
//!
//! Deterministic, non-cryptographic PRNG used to pick allocation sampling
//! points.
//!
//! ## Design
//!
//! - xoshiro128++ (32-bit output, 128-bit state)
//! - One instance per thread, owned by the thread's allocation context
//! - No locking and no sharing; the state never leaves its thread
//!
//! ## Technical References
//!
//! - [xoshiro / xoroshiro generators](https://prng.di.unimi.it/)
//! - [rand_core](https://docs.rs/rand_core) for the `RngCore` / `SeedableRng` traits

use rand::{RngCore, SeedableRng};
use rand_core::impls;

/// Scale factor mapping a `u32` onto `[0, 1)`: `1 / 2^32`.
const U32_TO_UNIT: f64 = 1.0 / (u32::MAX as f64 + 1.0);

/// xoshiro128++ generator owned by a single thread.
#[derive(Clone, PartialEq, Eq)]
#[repr(C)]
pub struct PerThreadRandom {
    state: [u32; 4],
}

impl PerThreadRandom {
    /// Create a generator from OS entropy.
    pub fn from_os_entropy() -> Self {
        Self::from_seed(rand::random::<[u8; 16]>())
    }

    /// Returns a uniformly distributed double in `[0, 1)`.
    ///
    /// Resolution is `1 / 2^32`.
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 * U32_TO_UNIT
    }

    /// Raw generator state, for diagnostics.
    pub fn state(&self) -> [u32; 4] {
        self.state
    }
}

impl RngCore for PerThreadRandom {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        let s = &mut self.state;
        let result = s[0].wrapping_add(s[3]).rotate_left(7).wrapping_add(s[0]);

        let t = s[1] << 9;
        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(11);

        result
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for PerThreadRandom {
    type Seed = [u8; 16];

    fn from_seed(seed: [u8; 16]) -> Self {
        // An all-zero state is a fixed point of the generator.
        if seed.iter().all(|&b| b == 0) {
            return Self::seed_from_u64(0);
        }

        let mut state = [0u32; 4];
        for (word, chunk) in state.iter_mut().zip(seed.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { state }
    }
}

impl Default for PerThreadRandom {
    fn default() -> Self {
        Self::from_os_entropy()
    }
}

impl std::fmt::Debug for PerThreadRandom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerThreadRandom").finish_non_exhaustive()
    }
}
