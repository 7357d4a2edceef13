use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delays with full jitter.
///
/// The n-th delay is drawn uniformly from `min..=min(max, min * 2^n)`, so a
/// fleet of connectors does not come back all at once after a relay restart.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        if ceiling <= self.min {
            return self.min;
        }
        let millis = rng.gen_range(self.min.as_millis() as u64..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Called once a link made it to `Active` again.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn test_ceiling_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let mut rng = StdRng::seed_from_u64(7);

        let ceilings: Vec<u64> = (0..6)
            .map(|_| {
                let ceiling = backoff.ceiling().as_millis() as u64;
                backoff.next_delay(&mut rng);
                ceiling
            })
            .collect();
        assert_eq!(ceilings, [100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_delays_stay_within_bounds() {
        let min = Duration::from_millis(50);
        let max = Duration::from_secs(5);
        let mut backoff = Backoff::new(min, max);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_delay(&mut rng);
            assert!(delay >= min && delay <= ceiling, "{delay:?} outside {min:?}..={ceiling:?}");
        }
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..5 {
            backoff.next_delay(&mut rng);
        }

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_millis(100));
    }
}
