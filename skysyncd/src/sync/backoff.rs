use rand::Rng;
use std::time::Duration;

/// Retries per path before it is parked in the error set.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60), true)
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// Delay before retry `attempt`; a server-provided `Retry-After` wins when
    /// it is longer.
    pub fn retry_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let computed = self.delay(attempt);
        match retry_after_secs {
            Some(secs) => computed.max(Duration::from_secs(secs)),
            None => computed,
        }
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        if !self.jitter || exp == 0 {
            return Duration::from_millis(exp);
        }
        // Half fixed, half random.
        let half = exp / 2;
        Duration::from_millis(half + rng.gen_range(0..=exp - half))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u128> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn retry_after_extends_delay() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(20), false);
        assert_eq!(backoff.retry_delay(0, Some(3)), Duration::from_secs(3));
        assert_eq!(backoff.retry_delay(0, None), Duration::from_millis(10));
    }
}
