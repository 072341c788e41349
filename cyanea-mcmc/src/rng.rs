//! The chain's single pseudo-random stream.

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// Seeded generator owned by a chain and lent to operators by `&mut`.
///
/// The full generator state serializes, so a resumed chain continues the
/// exact stream it was checkpointed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRng {
    seed: u64,
    inner: Xoshiro256PlusPlus,
}

impl ChainRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            seed,
            inner: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// The seed this stream started from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.inner.random::<f64>()
    }

    /// Uniform draw in `[lo, hi)`.
    pub fn uniform_in(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.uniform()
    }

    /// Uniform index in `0..n`. `n` must be positive.
    pub fn index(&mut self, n: usize) -> usize {
        self.inner.random_range(0..n)
    }

    /// Uniform integer in `lo..=hi`.
    pub fn integer(&mut self, lo: i64, hi: i64) -> i64 {
        self.inner.random_range(lo..=hi)
    }

    /// Standard normal draw.
    pub fn normal(&mut self) -> f64 {
        StandardNormal.sample(&mut self.inner)
    }

    /// Fair coin.
    pub fn coin(&mut self) -> bool {
        self.inner.random_bool(0.5)
    }
}
