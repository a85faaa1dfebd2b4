//! Retry scheduling. All retry decisions live here; callers never loop on
//! their own.

use rand::Rng;

use crate::model::{MutationItem, UnixTimeMs};

/// Largest exponent applied to the base delay; beyond this the cap wins anyway.
const MAX_EXPONENT: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(UnixTimeMs),
    GiveUp,
}

impl RetryPolicy {
    pub const fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// `min(max, base * 2^retry_count)` before jitter.
    pub fn capped_delay(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.min(MAX_EXPONENT);
        self.base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms)
    }

    /// Delay for a given jitter sample in `[0.0, 0.5]`; the result lies in
    /// `[capped / 2, capped]`.
    pub fn delay_with_jitter(&self, retry_count: u32, jitter: f64) -> u64 {
        let factor = 0.5 + jitter.clamp(0.0, 0.5);
        (self.capped_delay(retry_count) as f64 * factor).round() as u64
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> u64 {
        self.delay_with_jitter(retry_count, rng.gen_range(0.0..=0.5))
    }

    /// Decides what happens after a transient failure. `item.retry_count` is
    /// the number of failures before this one.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        item: &MutationItem,
        now: UnixTimeMs,
        rng: &mut R,
    ) -> RetryDecision {
        if item.retry_count.saturating_add(1) >= item.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAt(now.add_millis(self.next_delay(item.retry_count, rng)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use crate::test_support::sample_item;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn doubles_until_cap() {
        let policy = RetryPolicy::new(1_000, 60_000);
        assert_eq!(policy.capped_delay(0), 1_000);
        assert_eq!(policy.capped_delay(1), 2_000);
        assert_eq!(policy.capped_delay(5), 32_000);
        assert_eq!(policy.capped_delay(6), 60_000);
        assert_eq!(policy.capped_delay(u32::MAX), 60_000);
    }

    #[test]
    fn jitter_bounds() {
        let policy = RetryPolicy::new(1_000, 60_000);
        assert_eq!(policy.delay_with_jitter(2, 0.0), 2_000);
        assert_eq!(policy.delay_with_jitter(2, 0.5), 4_000);
        assert_eq!(policy.delay_with_jitter(2, 7.0), 4_000);
    }

    #[test]
    fn gives_up_on_the_last_allowed_failure() {
        let policy = RetryPolicy::new(10, 100);
        let mut rng = StdRng::seed_from_u64(7);
        let mut item = sample_item("a", Priority::Normal, 0);
        item.max_retries = 3;

        item.retry_count = 1;
        assert!(matches!(
            policy.decide(&item, UnixTimeMs(0), &mut rng),
            RetryDecision::RetryAt(_)
        ));
        item.retry_count = 2;
        assert_eq!(
            policy.decide(&item, UnixTimeMs(0), &mut rng),
            RetryDecision::GiveUp
        );
    }

    proptest! {
        #[test]
        fn delay_stays_within_half_and_full_cap(retry in 0u32..64, seed in any::<u64>()) {
            let policy = RetryPolicy::new(1_000, 60_000);
            let mut rng = StdRng::seed_from_u64(seed);
            let capped = policy.capped_delay(retry);
            let delay = policy.next_delay(retry, &mut rng);
            prop_assert!(delay >= capped / 2);
            prop_assert!(delay <= capped);
            prop_assert!(delay <= 60_000);
        }

        #[test]
        fn capped_delay_is_monotonic(base in 1u64..10_000, max_factor in 1u64..1_000, retry in 0u32..40) {
            let policy = RetryPolicy::new(base, base * max_factor);
            prop_assert!(policy.capped_delay(retry) <= policy.capped_delay(retry + 1));
        }
    }
}
