//! Resilience primitives shared by the streaming connections
//!
//! - Backoff strategies for reconnect scheduling
//! - Circuit breaker gating connection attempts
//! - Clock synchronization against broker server time
//! - Sliding-window and adaptive rate limiting

pub mod backoff;
pub mod circuit_breaker;
pub mod clock_sync;
pub mod rate_limit;

pub use backoff::{
    BackoffConfig, BackoffKind, BackoffStrategy, DecorrelatedJitterBackoff, ExponentialBackoff,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock_sync::{ClockSample, ClockSyncConfig, ClockSynchronizer};
pub use rate_limit::{
    retry_after_from_headers, AdaptiveRateLimitConfig, AdaptiveRateLimiter, RateLimiter,
};
