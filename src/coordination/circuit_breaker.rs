//! Circuit Breaker
//!
//! Tri-state gate placed in front of operations against a downstream that may
//! be failing (websocket handshakes, in practice). Backoff decides *when* to
//! retry; the breaker decides *whether* an attempt is made at all.

use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DxStreamError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failure threshold exceeded - calls rejected
    Open,
    /// Recovery probe - a single trial call at a time
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time to wait in Open before allowing a trial (milliseconds)
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Half-open trial slot; dropping it hands the trial to the next caller.
///
/// A trial dropped before finishing records neither success nor failure.
struct TrialSlot<'a> {
    breaker: Option<&'a CircuitBreaker>,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker {
            breaker.trial_in_flight.store(false, Ordering::SeqCst);
        }
    }
}

/// Circuit breaker wrapping arbitrary async operations
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    last_failure_time: RwLock<Option<Instant>>,
    trial_in_flight: AtomicBool,
    /// Total number of times circuit was opened
    open_count: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            last_failure_time: RwLock::new(None),
            trial_in_flight: AtomicBool::new(false),
            open_count: AtomicU64::new(0),
        }
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Run `operation` through the breaker.
    ///
    /// Rejects with [`DxStreamError::CircuitOpen`] without invoking the
    /// operation while open and the recovery timeout has not elapsed, or while
    /// another half-open trial is still running.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // Released on drop, so a cancelled trial frees the slot as well
        let _trial = self.acquire().await?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(e) => {
                debug!("Circuit breaker {} saw failure: {}", self.name, e);
                self.record_failure().await;
            }
        }
        result
    }

    /// Admission check. The returned slot holds the half-open trial, if any.
    async fn acquire(&self) -> Result<TrialSlot<'_>> {
        let state = *self.state.read().await;

        match state {
            CircuitState::Closed => Ok(TrialSlot { breaker: None }),
            CircuitState::Open => {
                let remaining = self.time_until_recovery().await;
                if !remaining.is_zero() {
                    return Err(DxStreamError::CircuitOpen {
                        retry_after: remaining,
                    });
                }

                {
                    let mut state = self.state.write().await;
                    if *state == CircuitState::Open {
                        *state = CircuitState::HalfOpen;
                        self.consecutive_successes.store(0, Ordering::SeqCst);
                        info!("Circuit breaker {} transitioning to half-open", self.name);
                    }
                }
                self.acquire_trial()
            }
            CircuitState::HalfOpen => self.acquire_trial(),
        }
    }

    fn acquire_trial(&self) -> Result<TrialSlot<'_>> {
        if self
            .trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(TrialSlot {
                breaker: Some(self),
            })
        } else {
            Err(DxStreamError::CircuitOpen {
                retry_after: Duration::ZERO,
            })
        }
    }

    /// Record a successful operation
    pub async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = self.state.write().await;
        if *state == CircuitState::HalfOpen && successes >= self.config.success_threshold {
            *state = CircuitState::Closed;
            self.consecutive_successes.store(0, Ordering::SeqCst);
            info!(
                "Circuit breaker {} closed after {} successful operations",
                self.name, successes
            );
        }
    }

    /// Record a failed operation
    pub async fn record_failure(&self) {
        self.consecutive_successes.store(0, Ordering::SeqCst);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_failure_time.write().await = Some(Instant::now());

        let mut state = self.state.write().await;
        match *state {
            // In half-open, any failure trips back to open
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                self.open_count.fetch_add(1, Ordering::SeqCst);
                warn!("Circuit breaker {} re-opened from half-open state", self.name);
            }
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                *state = CircuitState::Open;
                self.open_count.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "Circuit breaker {} opened after {} consecutive failures",
                    self.name, failures
                );
            }
            _ => {}
        }
    }

    async fn time_until_recovery(&self) -> Duration {
        match *self.last_failure_time.read().await {
            Some(last_failure) => self
                .config
                .recovery_timeout()
                .saturating_sub(last_failure.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Get the number of times circuit was opened
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Get consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Force reset the circuit breaker
    pub async fn reset(&self) {
        *self.state.write().await = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.trial_in_flight.store(false, Ordering::SeqCst);
        *self.last_failure_time.write().await = None;
        info!("Circuit breaker {} manually reset", self.name);
    }
}
