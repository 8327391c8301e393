use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{DataEvent, SubscriptionResponse};

/// One of the two DXTrade push feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    MarketData,
    Portfolio,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::MarketData, StreamKind::Portfolio];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::MarketData => "market_data",
            StreamKind::Portfolio => "portfolio",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a surfaced error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    Connection,
    Protocol,
    Authentication,
    ReconnectExhausted,
    /// `Error` frame sent by the broker
    Server,
}

/// Events delivered to callers of the dual-stream client
#[derive(Debug, Clone)]
pub enum DualStreamEvent {
    Connected {
        stream: StreamKind,
    },
    Disconnected {
        stream: StreamKind,
        code: u16,
        reason: String,
    },
    /// Session accepted on this socket
    Authenticated {
        stream: StreamKind,
    },
    Error {
        stream: StreamKind,
        kind: StreamErrorKind,
        message: String,
    },
    MarketData(Arc<DataEvent>),
    Portfolio(Arc<DataEvent>),
    PositionUpdate(Arc<DataEvent>),
    OrderUpdate(Arc<DataEvent>),
    PingRequest {
        stream: StreamKind,
        timestamp: i64,
        /// Whether a `Ping` echo went out
        responded: bool,
    },
    SubscriptionResponse {
        stream: StreamKind,
        response: SubscriptionResponse,
    },
    /// Every inbound frame, before typed dispatch
    Raw {
        stream: StreamKind,
        text: String,
    },
    Reconnecting {
        stream: StreamKind,
        attempt: u32,
        delay: Duration,
    },
    Reconnected {
        stream: StreamKind,
    },
    ReadyChanged {
        ready: bool,
    },
}
