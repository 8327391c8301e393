use serde::Serialize;

use super::events::StreamKind;

/// Minimum ping response rate for a stable session
pub const STABLE_RESPONSE_RATE: f64 = 0.9;

/// Status of one feed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub enabled: bool,
    pub connected: bool,
    pub authenticated: bool,
    pub subscribed: bool,
    pub message_count: u64,
    pub reconnect_attempts: u32,
    /// Reconnect budget spent; cleared by the next `connect()`
    pub exhausted: bool,
}

impl ConnectionStatus {
    fn disabled() -> Self {
        Self::default()
    }

    fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Disabled sides are vacuously ready
    pub fn is_ready(&self) -> bool {
        !self.enabled || (self.connected && self.subscribed)
    }
}

/// Server keepalive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingStats {
    pub requests_received: u64,
    pub responses_sent: u64,
}

impl PingStats {
    /// Responses over requests; 1.0 before any request
    pub fn response_rate(&self) -> f64 {
        if self.requests_received == 0 {
            return 1.0;
        }
        self.responses_sent as f64 / self.requests_received as f64
    }

    pub fn is_stable(&self) -> bool {
        self.response_rate() >= STABLE_RESPONSE_RATE
    }
}

/// Aggregate client status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DualStreamStatus {
    pub market_data: ConnectionStatus,
    pub portfolio: ConnectionStatus,
    pub ping_stats: PingStats,
    pub is_ready: bool,
}

impl DualStreamStatus {
    pub fn new(market_data_enabled: bool, portfolio_enabled: bool) -> Self {
        let side = |enabled| {
            if enabled {
                ConnectionStatus::enabled()
            } else {
                ConnectionStatus::disabled()
            }
        };
        let mut status = Self {
            market_data: side(market_data_enabled),
            portfolio: side(portfolio_enabled),
            ping_stats: PingStats::default(),
            is_ready: false,
        };
        status.is_ready = status.compute_ready();
        status
    }

    pub fn side(&self, kind: StreamKind) -> &ConnectionStatus {
        match kind {
            StreamKind::MarketData => &self.market_data,
            StreamKind::Portfolio => &self.portfolio,
        }
    }

    pub fn side_mut(&mut self, kind: StreamKind) -> &mut ConnectionStatus {
        match kind {
            StreamKind::MarketData => &mut self.market_data,
            StreamKind::Portfolio => &mut self.portfolio,
        }
    }

    /// Every enabled side connected and subscribed
    pub fn compute_ready(&self) -> bool {
        let any_enabled = self.market_data.enabled || self.portfolio.enabled;
        any_enabled && self.market_data.is_ready() && self.portfolio.is_ready()
    }

    /// Recompute `is_ready`; returns the new value when it changed.
    pub fn refresh_ready(&mut self) -> Option<bool> {
        let ready = self.compute_ready();
        if ready == self.is_ready {
            return None;
        }
        self.is_ready = ready;
        Some(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_ignores_disabled_side() {
        let mut status = DualStreamStatus::new(true, false);
        assert!(!status.is_ready);

        status.market_data.connected = true;
        assert_eq!(status.refresh_ready(), None);
        status.market_data.subscribed = true;
        assert_eq!(status.refresh_ready(), Some(true));

        status.market_data.connected = false;
        assert_eq!(status.refresh_ready(), Some(false));
    }

    #[test]
    fn test_ready_requires_both_enabled_sides() {
        let mut status = DualStreamStatus::new(true, true);
        status.market_data.connected = true;
        status.market_data.subscribed = true;
        assert!(!status.compute_ready());
        status.portfolio.connected = true;
        status.portfolio.subscribed = true;
        assert!(status.compute_ready());
    }

    #[test]
    fn test_ping_stability() {
        let mut stats = PingStats::default();
        assert!(stats.is_stable());
        stats.requests_received = 10;
        stats.responses_sent = 9;
        assert!(stats.is_stable());
        stats.responses_sent = 8;
        assert!(!stats.is_stable());
    }

    #[test]
    fn test_status_json_shape() {
        let status = DualStreamStatus::new(true, false);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["marketData"]["enabled"], true);
        assert_eq!(value["pingStats"]["requestsReceived"], 0);
        assert_eq!(value["isReady"], false);
    }
}
