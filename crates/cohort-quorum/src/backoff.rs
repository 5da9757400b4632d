//! Reconnect delay policies.

use rand::Rng;
use std::time::Duration;

/// Decides how long to wait before reconnect attempt `attempt` (1-based).
/// `None` stops reconnecting.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff with a cap and optional jitter.
///
/// Defaults match the browser reconnecting-socket behaviour the experiment
/// server was built against: 1s, growing by 1.5x, capped at 30s, forever.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fractional jitter applied symmetrically, `0.0` for none.
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            factor: 1.5,
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    #[must_use]
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let base = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let mut secs = base.min(self.max.as_secs_f64());
        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            secs = (secs * (1.0 + spread)).min(self.max.as_secs_f64());
        }
        Some(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Constant delay, optionally bounded.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_grows_and_caps() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.delay(2), Some(Duration::from_millis(1500)));
        assert_eq!(backoff.delay(3), Some(Duration::from_millis(2250)));
        assert_eq!(backoff.delay(50), Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn exponential_never_gives_up_by_default() {
        assert!(ExponentialBackoff::default().delay(10_000).is_some());
    }

    #[test]
    fn attempt_limit() {
        let backoff = ExponentialBackoff::default().with_max_attempts(3);
        assert!(backoff.delay(3).is_some());
        assert!(backoff.delay(4).is_none());

        let fixed = FixedBackoff::new(Duration::from_millis(5)).with_max_attempts(1);
        assert_eq!(fixed.delay(1), Some(Duration::from_millis(5)));
        assert_eq!(fixed.delay(2), None);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let backoff = ExponentialBackoff::default().with_jitter(0.5);
        for _ in 0..100 {
            let delay = backoff.delay(1).unwrap();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
