//! Exponential redial backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Delay between reconnection attempts to a gateway.
///
/// Grows by `factor` per attempt up to `max`, with `±jitter` randomization. A fresh
/// `RedialBackoff` (or [`RedialBackoff::reset`]) starts again from `min`.
#[derive(Debug, Clone, Copy)]
pub struct RedialBackoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl RedialBackoff {
    pub const fn new(min: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        RedialBackoff {
            min,
            max,
            factor,
            jitter,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter_factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(jitter_factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self) -> Duration {
        let multiplier = self.factor.powi(self.attempt.min(64) as i32);
        let secs = (self.min.as_secs_f64() * multiplier).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

impl Default for RedialBackoff {
    /// 1s doubling up to 15s, ±20% jitter
    fn default() -> Self {
        RedialBackoff::new(Duration::from_secs(1), Duration::from_secs(15), 2.0, 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_max() {
        let mut backoff =
            RedialBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0, 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn reset_returns_to_min() {
        let mut backoff =
            RedialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0, 0.0);
        for _ in 0..5 {
            let _ = backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut backoff = RedialBackoff::default();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(800));
        assert!(first <= Duration::from_millis(1200));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(15));
        }
    }
}
