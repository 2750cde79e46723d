//! Retry backoff
//!
//! Exponential with jitter: attempt `n` waits a random time between half
//! and all of `base * 2^(n-1)`, never more than the configured cap.

use std::time::Duration;

use rand::Rng;

/// Delay before the first retry, unless the cap is lower
pub const BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct Backoff {
    attempts: u32,
    max_attempts: u32,
    max_wait: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, max_wait: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            max_wait,
        }
    }

    /// Failed attempts since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Records a failure; `None` once the attempt limit is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            return None;
        }
        let ceiling = self.ceiling(self.attempts);
        let floor = ceiling / 2;
        let jittered = rand::thread_rng().gen_range(floor.as_millis()..=ceiling.as_millis());
        Some(Duration::from_millis(jittered as u64))
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        let base = BASE_DELAY.min(self.max_wait);
        let factor = 1u32.checked_shl(attempt.saturating_sub(1).min(31)).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.max_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(u32::MAX, Duration::from_secs(10));
        let mut previous_ceiling = Duration::ZERO;
        for attempt in 1..=8 {
            let delay = backoff.next_delay().unwrap();
            let ceiling = backoff.ceiling(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
            assert!(ceiling >= previous_ceiling);
            previous_ceiling = ceiling;
        }
        assert_eq!(previous_ceiling, Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_limit() {
        // three attempts: the first try plus two retries
        let mut backoff = Backoff::new(3, Duration::from_millis(10));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_small_cap_lowers_base() {
        let backoff = Backoff::new(10, Duration::from_millis(20));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(20));
    }
}
