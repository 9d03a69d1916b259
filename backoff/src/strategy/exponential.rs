use std::time::Duration;

use rand::Rng;

/// Backoff whose delay doubles (or grows by `factor`) on every attempt.
///
/// The n-th delay is `base_interval * factor^(n - 1)`, stretched by a random amount of up to
/// `jitter` (so `0.5` adds between 0% and 50%) and capped at `max_interval`. Jitter only ever
/// lengthens a delay so concurrent writers spread out instead of retrying in lockstep.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
///
/// let mut backoff = Exponential::from_millis(1000, 60_000, 2.0, 0.5, Some(5));
/// let first = backoff.next().unwrap();
/// assert!(first.as_millis() >= 1000 && first.as_millis() <= 1500);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    /// Upper bound of the random stretch, between 0.0 and 1.0.
    jitter: f64,
    /// None retries forever.
    max_attempts: Option<u16>,
    current_attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            current_attempt: 0,
        }
    }

    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Number of delays handed out so far.
    pub fn current_attempt(&self) -> u16 {
        self.current_attempt
    }

    fn calculate_delay(&self, attempt: u16) -> Duration {
        // attempt is never 0 here, but powi(-1) would silently shrink the delay
        let exponent = attempt.max(1) - 1;
        let base_delay_ms =
            (self.base_interval.as_millis() as f64) * self.factor.powi(i32::from(exponent));

        if self.jitter == 0.0 {
            return Duration::from_millis(base_delay_ms as u64).min(self.max_interval);
        }

        let stretch: f64 = rand::rng().random_range(1.0..=1.0 + self.jitter);
        Duration::from_millis((base_delay_ms * stretch) as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.current_attempt >= max_attempts
        {
            return None;
        }

        self.current_attempt += 1;
        Some(self.calculate_delay(self.current_attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_without_jitter() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_capped_at_max_interval() {
        let mut backoff = Exponential::from_millis(100, 300, 2.0, 0.0, None);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_runs_dry_after_max_attempts() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.0, Some(3));

        assert_eq!(backoff.by_ref().count(), 3);
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.current_attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.current_attempt(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_only_lengthens() {
        for _ in 0..100 {
            let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.5, None);
            let first = backoff.next().unwrap();
            assert!(first >= Duration::from_millis(100));
            assert!(first <= Duration::from_millis(150));

            let second = backoff.next().unwrap();
            assert!(second >= Duration::from_millis(200));
            assert!(second <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_jitter_is_clamped() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 7.0, None);
        assert!(backoff.next().unwrap() <= Duration::from_millis(200));
    }
}
