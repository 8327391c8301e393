//! Reconnection backoff strategies
//!
//! Both strategies map an attempt count to a delay and signal exhaustion with
//! `None` once the attempt budget is spent. Callers must treat `None` as
//! terminal.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// A reconnect delay policy.
pub trait BackoffStrategy: Send + Sync + std::fmt::Debug {
    /// Delay before retry number `attempt` (0-based), or `None` when exhausted.
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// Forget accumulated state after a successful connection.
    fn reset(&mut self);

    /// Attempt budget.
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff with optional full jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Replace the computed delay with `uniform(0, delay)`
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Pre-jitter delay: `min(max_delay, initial * multiplier^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = initial_ms * self.multiplier.max(1.0).powi(exponent);
        // powi overflows to inf for large attempts; min() keeps it bounded
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped as u64)
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let delay = self.base_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return Some(delay);
        }

        let ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
        Some(Duration::from_millis(ms))
    }

    fn reset(&mut self) {}

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Decorrelated jitter: `min(max_delay, uniform(base, previous * 3))`.
#[derive(Debug, Clone)]
pub struct DecorrelatedJitterBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    previous: Duration,
}

impl DecorrelatedJitterBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            previous: base_delay,
        }
    }

    /// Delay handed out by the previous call (seed for the next one).
    pub fn previous_delay(&self) -> Duration {
        self.previous
    }
}

impl BackoffStrategy for DecorrelatedJitterBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let low = self.base_delay.as_millis() as u64;
        let high = (self.previous.as_millis() as u64).saturating_mul(3).max(low);
        let ms = rand::thread_rng().gen_range(low..=high);
        let delay = Duration::from_millis(ms).min(self.max_delay);

        self.previous = delay;
        Some(delay)
    }

    fn reset(&mut self) {
        self.previous = self.base_delay;
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Serializable selection of a backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Decorrelated,
}

/// Backoff parameters shared by both strategies
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> Box<dyn BackoffStrategy> {
        match self.kind {
            BackoffKind::Exponential => Box::new(ExponentialBackoff {
                initial_delay: self.initial_delay,
                max_delay: self.max_delay,
                multiplier: self.multiplier,
                max_attempts: self.max_attempts,
                jitter: self.jitter,
            }),
            BackoffKind::Decorrelated => Box::new(DecorrelatedJitterBackoff::new(
                self.initial_delay,
                self.max_delay,
                self.max_attempts,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(jitter: bool) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
            multiplier: 2.0,
            max_attempts: 50,
            jitter,
        }
    }

    #[test]
    fn test_base_delay_monotonic_and_capped() {
        let backoff = exponential(false);
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = backoff.base_delay(attempt);
            assert!(delay >= previous, "attempt {} decreased", attempt);
            assert!(delay <= backoff.max_delay);
            previous = delay;
        }
        assert_eq!(backoff.base_delay(0), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(800));
        assert_eq!(backoff.base_delay(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_full_jitter_within_bounds() {
        let mut backoff = exponential(true);
        for attempt in 0..20 {
            let cap = backoff.base_delay(attempt);
            let delay = backoff.next_delay(attempt).unwrap();
            assert!(delay <= cap);
        }
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let mut backoff = ExponentialBackoff {
            max_attempts: 3,
            jitter: false,
            ..exponential(false)
        };
        assert!(backoff.next_delay(2).is_some());
        assert!(backoff.next_delay(3).is_none());
        assert!(backoff.next_delay(4).is_none());
    }

    #[test]
    fn test_decorrelated_spread_and_reset() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(2_000);
        let mut backoff = DecorrelatedJitterBackoff::new(base, max, 100);

        for attempt in 0..50 {
            let seed = backoff.previous_delay();
            let delay = backoff.next_delay(attempt).unwrap();
            assert!(delay >= base.min(max));
            assert!(delay <= max);
            assert!(delay <= (seed * 3).max(base));
        }

        backoff.reset();
        assert_eq!(backoff.previous_delay(), base);
        assert!(backoff.next_delay(100).is_none());
    }

    #[test]
    fn test_config_builds_selected_kind() {
        let config = BackoffConfig {
            kind: BackoffKind::Decorrelated,
            max_attempts: 4,
            ..Default::default()
        };
        let strategy = config.build();
        assert_eq!(strategy.max_attempts(), 4);
        assert!(format!("{:?}", strategy).contains("DecorrelatedJitterBackoff"));
    }
}
