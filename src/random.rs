// Deterministic per-read random stream.
//
// Tie-breaks (mate order, equal-scoring hit selection, backtrace cell
// ties) draw from a generator reseeded from the read's opaque 64-bit
// seed at fixed points in the pipeline, so single-threaded runs are
// byte-identical regardless of scheduling.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Wrapper around a seedable generator with the handful of draws the
/// engine needs.
#[derive(Debug)]
pub struct ReadRng {
    rng: SmallRng,
}

impl ReadRng {
    /// Seed from a read seed rotated by a stage-specific amount. Each
    /// pipeline stage uses a distinct rotation so draws do not correlate
    /// across stages.
    pub fn seeded(seed: u64, rot: u32) -> Self {
        ReadRng {
            rng: SmallRng::seed_from_u64(seed.rotate_left(rot)),
        }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.rng.gen()
    }

    /// Uniform draw in [0, n); n must be nonzero.
    #[inline]
    pub fn below(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n)
    }

    /// One of {0, 1}; used for mate-order randomization.
    #[inline]
    pub fn coin(&mut self) -> bool {
        self.rng.gen()
    }
}
