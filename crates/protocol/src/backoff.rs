//! Randomized exponential backoff.
//!
//! Retry delays are drawn uniformly from `[0, base · 2^attempt]` so
//! colliding retriers spread out instead of herding. The exponent is
//! clamped to keep the cap finite.

use rand::Rng;

const MAX_SHIFT: u32 = 16;

/// Draws a retry delay for the given attempt number (0-based).
pub fn retry_delay_ms<R: Rng + ?Sized>(base_ms: u64, attempt: u32, rng: &mut R) -> u64 {
    let cap = base_ms.saturating_mul(1u64 << attempt.min(MAX_SHIFT));
    if cap == 0 {
        return 0;
    }
    rng.gen_range(0..=cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn delays_stay_within_the_doubling_cap() {
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..10 {
            let cap = 250u64 << attempt;
            for _ in 0..100 {
                assert!(retry_delay_ms(250, attempt, &mut rng) <= cap);
            }
        }
    }

    #[test]
    fn zero_base_never_delays() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(retry_delay_ms(0, 5, &mut rng), 0);
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let mut rng = StdRng::seed_from_u64(7);
        let d = retry_delay_ms(u64::MAX / 2, 63, &mut rng);
        assert!(d <= u64::MAX);
    }
}
