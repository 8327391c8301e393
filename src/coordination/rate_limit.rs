//! Sliding-window rate limiting
//!
//! [`RateLimiter`] keeps the timestamps of admitted calls inside the window and
//! rejects once `limit` of them are present. Server hints (`retry-after`,
//! `x-ratelimit-*`) can impose a cooldown independent of the local window.
//! [`AdaptiveRateLimiter`] rescales the effective limit from the observed
//! error rate.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::{debug, info, warn};

use crate::error::{DxStreamError, Result};

/// Retry hint carried by `retry-after` or by `x-ratelimit-remaining: 0` plus
/// `x-ratelimit-reset`.
///
/// `x-ratelimit-reset` is accepted as either seconds-until-reset or an epoch
/// timestamp in seconds.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let header_u64 = |name: &str| -> Option<u64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v.ceil() as u64)
    };

    if let Some(secs) = header_u64("retry-after") {
        return Some(Duration::from_secs(secs));
    }

    if header_u64("x-ratelimit-remaining") == Some(0) {
        if let Some(reset) = header_u64("x-ratelimit-reset") {
            // Anything this large is an epoch timestamp, not a delta
            let secs = if reset > 1_000_000_000 {
                reset.saturating_sub(Utc::now().timestamp().max(0) as u64)
            } else {
                reset
            };
            return Some(Duration::from_secs(secs));
        }
    }

    None
}

#[derive(Debug)]
struct Window {
    timestamps: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

/// Sliding-window limiter
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    inner: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            inner: Mutex::new(Window {
                timestamps: VecDeque::with_capacity(limit),
                cooldown_until: None,
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit one call or fail with [`DxStreamError::RateLimited`].
    pub fn consume(&self) -> Result<()> {
        self.consume_n_with_limit(1, self.limit)
    }

    /// Admit `n` calls together or none of them.
    pub fn consume_n(&self, n: usize) -> Result<()> {
        self.consume_n_with_limit(n, self.limit)
    }

    fn consume_n_with_limit(&self, n: usize, limit: usize) -> Result<()> {
        let now = Instant::now();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| DxStreamError::Internal("rate limiter lock poisoned".to_string()))?;

        if let Some(until) = inner.cooldown_until {
            if until > now {
                return Err(DxStreamError::RateLimited {
                    retry_after: until - now,
                });
            }
            inner.cooldown_until = None;
        }

        Self::evict(&mut inner.timestamps, now, self.window);

        let limit = limit.max(1);
        if n > limit {
            return Err(DxStreamError::RateLimited {
                retry_after: self.window,
            });
        }
        if inner.timestamps.len() + n > limit {
            // The entry whose expiry leaves room for all n decides the wait
            let retry_after = inner
                .timestamps
                .get(inner.timestamps.len() + n - limit - 1)
                .map(|entry| (*entry + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(DxStreamError::RateLimited { retry_after });
        }

        inner.timestamps.extend(std::iter::repeat(now).take(n));
        Ok(())
    }

    fn evict(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Calls still counted inside the window
    pub fn in_window(&self) -> usize {
        match self.inner.lock() {
            Ok(mut inner) => {
                Self::evict(&mut inner.timestamps, Instant::now(), self.window);
                inner.timestamps.len()
            }
            Err(_) => 0,
        }
    }

    /// Force a cooldown regardless of the local window.
    pub fn cooldown(&self, duration: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            let until = Instant::now() + duration;
            inner.cooldown_until = Some(match inner.cooldown_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
            warn!("Rate limiter cooling down for {:?}", duration);
        }
    }

    /// Apply server rate-limit headers. Returns the imposed cooldown, if any.
    pub fn update_from_headers(&self, headers: &HeaderMap) -> Option<Duration> {
        let retry_after = retry_after_from_headers(headers)?;
        self.cooldown(retry_after);
        Some(retry_after)
    }

    pub fn reset(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.timestamps.clear();
            inner.cooldown_until = None;
        }
    }
}

/// Adaptive limiter configuration
#[derive(Debug, Clone)]
pub struct AdaptiveRateLimitConfig {
    pub limit: usize,
    pub window: Duration,
    pub adjustment_interval: Duration,
    /// Error rate below which the limit grows by 10%
    pub low_error_rate: f64,
    /// Error rate above which the limit shrinks by 20%
    pub high_error_rate: f64,
}

impl Default for AdaptiveRateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(1),
            adjustment_interval: Duration::from_secs(60),
            low_error_rate: 0.01,
            high_error_rate: 0.05,
        }
    }
}

pub const MIN_MULTIPLIER: f64 = 0.1;
pub const MAX_MULTIPLIER: f64 = 1.0;

#[derive(Debug)]
struct Outcomes {
    successes: u64,
    errors: u64,
    multiplier: f64,
    last_adjustment: Instant,
}

/// Rate limiter whose effective limit follows the observed error rate
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: AdaptiveRateLimitConfig,
    limiter: RateLimiter,
    outcomes: Mutex<Outcomes>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: AdaptiveRateLimitConfig) -> Self {
        let limiter = RateLimiter::new(config.limit, config.window);
        Self {
            config,
            limiter,
            outcomes: Mutex::new(Outcomes {
                successes: 0,
                errors: 0,
                multiplier: MAX_MULTIPLIER,
                last_adjustment: Instant::now(),
            }),
        }
    }

    pub fn consume(&self) -> Result<()> {
        self.consume_n(1)
    }

    /// Admit `n` calls against the adjusted limit, all or nothing.
    pub fn consume_n(&self, n: usize) -> Result<()> {
        self.maybe_adjust();
        self.limiter.consume_n_with_limit(n, self.effective_limit())
    }

    pub fn record_success(&self) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.successes += 1;
        }
        self.maybe_adjust();
    }

    pub fn record_error(&self) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.errors += 1;
        }
        self.maybe_adjust();
    }

    pub fn multiplier(&self) -> f64 {
        self.outcomes
            .lock()
            .map(|o| o.multiplier)
            .unwrap_or(MAX_MULTIPLIER)
    }

    /// `max(1, floor(limit * multiplier))`
    pub fn effective_limit(&self) -> usize {
        ((self.config.limit as f64 * self.multiplier()).floor() as usize).max(1)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn maybe_adjust(&self) {
        let Ok(mut outcomes) = self.outcomes.lock() else {
            return;
        };
        if outcomes.last_adjustment.elapsed() < self.config.adjustment_interval {
            return;
        }
        self.adjust_locked(&mut outcomes);
    }

    /// Recompute the multiplier now, ignoring the adjustment interval.
    pub fn adjust(&self) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            self.adjust_locked(&mut outcomes);
        }
    }

    fn adjust_locked(&self, outcomes: &mut Outcomes) {
        let total = outcomes.successes + outcomes.errors;
        if total > 0 {
            let error_rate = outcomes.errors as f64 / total as f64;
            let previous = outcomes.multiplier;
            if error_rate < self.config.low_error_rate {
                outcomes.multiplier = (outcomes.multiplier * 1.1).min(MAX_MULTIPLIER);
            } else if error_rate > self.config.high_error_rate {
                outcomes.multiplier = (outcomes.multiplier * 0.8).max(MIN_MULTIPLIER);
            }

            if (outcomes.multiplier - previous).abs() > f64::EPSILON {
                info!(
                    "Adaptive rate limit adjusted: error_rate={:.3} multiplier {:.2} -> {:.2}",
                    error_rate, previous, outcomes.multiplier
                );
            } else {
                debug!("Adaptive rate limit unchanged at {:.2}", outcomes.multiplier);
            }
        }

        outcomes.successes = 0;
        outcomes.errors = 0;
        outcomes.last_adjustment = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[tokio::test]
    async fn test_rejects_limit_plus_one_until_oldest_ages_out() {
        let limiter = RateLimiter::new(3, Duration::from_millis(100));
        assert_ok!(limiter.consume());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_ok!(limiter.consume());
        assert_ok!(limiter.consume());

        match limiter.consume() {
            Err(DxStreamError::RateLimited { retry_after }) => {
                assert!(retry_after <= Duration::from_millis(100));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }

        // First timestamp ages out, the other two are still inside the window
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_ok!(limiter.consume());
        assert_err!(limiter.consume());
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test]
    async fn test_cooldown_overrides_window() {
        let limiter = RateLimiter::new(100, Duration::from_secs(1));
        limiter.cooldown(Duration::from_millis(50));
        assert_err!(limiter.consume());
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_ok!(limiter.consume());
    }

    #[test]
    fn test_consume_n_is_all_or_nothing() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert_ok!(limiter.consume());
        assert_ok!(limiter.consume());

        // One slot left: a pair is refused and the slot stays free
        assert_err!(limiter.consume_n(2));
        assert_eq!(limiter.in_window(), 2);
        assert_ok!(limiter.consume());
        assert_eq!(limiter.in_window(), 3);

        let roomy = RateLimiter::new(4, Duration::from_secs(60));
        assert_ok!(roomy.consume_n(2));
        assert_ok!(roomy.consume_n(2));
        assert_err!(roomy.consume_n(1));
        assert_err!(RateLimiter::new(1, Duration::from_secs(60)).consume_n(2));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(7)));

        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        assert_eq!(limiter.update_from_headers(&headers), Some(Duration::from_secs(7)));
        assert!(limiter.consume().is_err());
    }

    #[test]
    fn test_ratelimit_reset_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("12"));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(12)));

        let epoch = (Utc::now().timestamp() + 30).to_string();
        headers.insert("x-ratelimit-reset", HeaderValue::from_str(&epoch).unwrap());
        let hint = retry_after_from_headers(&headers).unwrap();
        assert!(hint <= Duration::from_secs(30) && hint >= Duration::from_secs(28));

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4"));
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    fn adaptive() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(AdaptiveRateLimitConfig {
            limit: 10,
            window: Duration::from_secs(1),
            adjustment_interval: Duration::from_secs(3600),
            ..Default::default()
        })
    }

    #[test]
    fn test_adaptive_scales_down_on_errors() {
        let limiter = adaptive();
        for _ in 0..90 {
            limiter.record_success();
        }
        for _ in 0..10 {
            limiter.record_error();
        }
        limiter.adjust();
        assert!((limiter.multiplier() - 0.8).abs() < 1e-9);
        assert_eq!(limiter.effective_limit(), 8);
    }

    #[test]
    fn test_adaptive_multiplier_bounds() {
        let limiter = adaptive();
        for _ in 0..30 {
            limiter.record_error();
            limiter.adjust();
        }
        assert!((limiter.multiplier() - MIN_MULTIPLIER).abs() < 1e-9);
        assert_eq!(limiter.effective_limit(), 1);

        for _ in 0..60 {
            limiter.record_success();
            limiter.adjust();
        }
        assert!((limiter.multiplier() - MAX_MULTIPLIER).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_middle_band_unchanged() {
        let limiter = adaptive();
        for _ in 0..97 {
            limiter.record_success();
        }
        for _ in 0..3 {
            limiter.record_error();
        }
        limiter.adjust();
        assert!((limiter.multiplier() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_adaptive_consume_uses_effective_limit() {
        let limiter = adaptive();
        for _ in 0..10 {
            limiter.record_error();
        }
        limiter.adjust();
        assert_eq!(limiter.effective_limit(), 8);

        for _ in 0..8 {
            assert_ok!(limiter.consume());
        }
        assert_err!(limiter.consume());
    }
}
