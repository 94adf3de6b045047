//! Seeded randomness for reproducible tests.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// A deterministic RNG; the same seed always replays the same draws.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
