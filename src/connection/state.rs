use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::ParsedMessage;

/// Lifecycle of a single socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Caller-initiated shutdown only
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Connecting or open; `connect()` is a no-op in these states
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closing => write!(f, "CLOSING"),
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Error => write!(f, "ERROR"),
        }
    }
}

/// Events broadcast by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Opened {
        /// False for the first successful open of this instance
        reconnected: bool,
    },
    Closed {
        code: u16,
        reason: String,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
    /// Every inbound text frame, before parsing
    Raw(String),
    Message(Arc<ParsedMessage>),
    ProtocolError {
        error: String,
        raw_preview: String,
    },
    Error(String),
}

/// Result of [`Connection::send`](super::Connection::send)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub reconnects: AtomicU64,
    /// Epoch millis of the last inbound frame, 0 if none
    pub last_message_ms: AtomicI64,
}

impl StatsCounters {
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        let last_ms = self.last_message_ms.load(Ordering::Relaxed);
        ConnectionStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_message_at: if last_ms == 0 {
                None
            } else {
                Utc.timestamp_millis_opt(last_ms).single()
            },
        }
    }
}

/// Point-in-time connection counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub protocol_errors: u64,
    /// Messages evicted from the outbound queue
    pub queue_dropped: u64,
    /// Reconnect attempts scheduled
    pub reconnects: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Open.is_open());
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Closing.is_active());
        assert_eq!(ConnectionState::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_stats_snapshot() {
        let counters = StatsCounters::default();
        assert_eq!(counters.snapshot().last_message_at, None);

        counters.record_received();
        counters.record_sent();
        counters.record_sent();
        let stats = counters.snapshot();
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.messages_sent, 2);
        assert!(stats.last_message_at.is_some());
    }
}
