//! Resilient single-socket connection
//!
//! A [`Connection`] owns one websocket at a time and handles:
//! - handshake (optionally behind a circuit breaker) and the session greeting
//! - heartbeat with pong timeout
//! - subscription templates re-issued on every open
//! - a bounded, lossy outbound queue drained FIFO on open
//! - backoff-governed reconnection after abnormal closes

pub mod machine;
pub mod queue;
pub mod state;
pub mod subscription;

use std::time::Duration;

use crate::coordination::{BackoffConfig, CircuitBreakerConfig};
use crate::dxtrade::SessionToken;

pub use machine::{Connection, Greeting, EVENT_CHANNEL_CAPACITY};
pub use queue::{OutboundQueue, QueuedMessage};
pub use state::{ConnectionEvent, ConnectionState, ConnectionStats, SendOutcome};
pub use subscription::{Subscription, SubscriptionKey};

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Name used in logs and errors (`market_data`, `portfolio`)
    pub name: String,
    pub url: String,
    /// Session token stamped on subscription requests
    pub session: Option<SessionToken>,
    pub connect_timeout: Duration,
    /// Websocket ping period; `None` disables the client heartbeat
    pub heartbeat_interval: Option<Duration>,
    pub pong_timeout: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub max_queue_size: usize,
    pub backoff: BackoffConfig,
    /// Gate handshakes through a circuit breaker when set
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            session: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
            pong_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            max_queue_size: 1000,
            backoff: BackoffConfig::default(),
            circuit_breaker: None,
        }
    }

    pub fn session_str(&self) -> &str {
        self.session.as_ref().map(SessionToken::expose).unwrap_or("")
    }
}
