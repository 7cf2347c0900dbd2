use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Delay policy keyed by the number of consecutive failures so far
pub trait Backoff: Send + Sync + std::fmt::Debug {
    /// `failures` is 1 after the first failure
    fn next_delay(&self, failures: u32) -> Duration;
}

/// Same delay regardless of how many failures preceded it
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(Duration);

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self(delay)
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _failures: u32) -> Duration {
        self.0
    }
}

/// `base * factor^(failures - 1)`, capped, then spread by a relative jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    /// Deterministic part of the delay
    fn ceiling(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let scaled = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, failures: u32) -> Duration {
        let ceiling = self.ceiling(failures);
        if self.jitter == 0.0 {
            return ceiling;
        }

        let spread = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        let delay = ceiling.mul_f64(spread).min(self.cap);
        trace!(
            failures = failures,
            ceiling_ms = ceiling.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Exponential backoff"
        );
        delay
    }
}

#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.base = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.cap = delay;
        self
    }

    /// Growth per failure; values below 1 are raised to 1
    pub fn multiplier(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Relative spread in `[0, 1]`
    pub fn jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            base: self.base,
            cap: self.cap.max(self.base),
            factor: self.factor,
            jitter: self.jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(60))
            .jitter_factor(0.0)
            .build();

        let delays: Vec<u64> = (1..=6).map(|n| backoff.next_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(backoff.next_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_spread() {
        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(10))
            .jitter_factor(0.2)
            .build();

        let delays: Vec<Duration> = (0..200).map(|_| backoff.next_delay(2)).collect();
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(1599) && *d <= Duration::from_millis(2401)));
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn test_fixed_backoff_ignores_failure_count() {
        let backoff = FixedBackoff::new(Duration::from_secs(5));
        assert!((1..10).all(|n| backoff.next_delay(n) == Duration::from_secs(5)));
    }

    #[test]
    fn test_builder_clamps_inputs() {
        let backoff = ExponentialBackoff::builder()
            .initial_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .multiplier(0.5)
            .jitter_factor(3.0)
            .build();
        assert_eq!(backoff.cap, Duration::from_secs(2));
        assert_eq!(backoff.factor, 1.0);
        assert_eq!(backoff.jitter, 1.0);
    }
}
