use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::coordination::{
    AdaptiveRateLimitConfig, BackoffConfig, BackoffKind, CircuitBreakerConfig, ClockSyncConfig,
};
use crate::dxtrade::{SessionCredentials, SessionToken, StreamKind};
use crate::error::{DxStreamError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub dxtrade: DualStreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dual-stream client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DualStreamConfig {
    /// Market data websocket endpoint
    pub market_data_url: String,
    /// Portfolio/account events websocket endpoint
    pub portfolio_url: String,
    /// Account used in market data requests; falls back to the session account
    pub account_id: String,
    /// Default symbol set
    pub symbols: Vec<String>,
    pub enable_market_data: bool,
    pub enable_portfolio: bool,
    /// Answer server `PingRequest`s
    pub enable_ping_response: bool,
    pub connection_timeout_ms: u64,
    /// Websocket ping period (0 disables the client heartbeat)
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    /// Initial reconnect delay
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub auto_reconnect: bool,
    pub max_queue_size: usize,
    pub backoff: BackoffKind,
    pub jitter: bool,
    pub candle_type: String,
    /// Subscription requests allowed per window
    pub subscription_rate_limit: usize,
    pub subscription_rate_window_ms: u64,
    /// Gate handshakes through a circuit breaker when present
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Maximum tolerated server timestamp drift
    pub clock_max_drift_ms: u64,
}

impl Default for DualStreamConfig {
    fn default() -> Self {
        Self {
            market_data_url: "wss://demo.dx.trade/dxsca-web/md?format=JSON".to_string(),
            portfolio_url: "wss://demo.dx.trade/dxsca-web/?format=JSON".to_string(),
            account_id: String::new(),
            symbols: vec!["EUR/USD".to_string(), "GBP/USD".to_string()],
            enable_market_data: true,
            enable_portfolio: true,
            enable_ping_response: true,
            connection_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            auto_reconnect: true,
            max_queue_size: 1_000,
            backoff: BackoffKind::Exponential,
            jitter: true,
            candle_type: "1m".to_string(),
            subscription_rate_limit: 10,
            subscription_rate_window_ms: 1_000,
            circuit_breaker: None,
            clock_max_drift_ms: 30_000,
        }
    }
}

impl DualStreamConfig {
    pub fn is_enabled(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::MarketData => self.enable_market_data,
            StreamKind::Portfolio => self.enable_portfolio,
        }
    }

    pub fn url_for(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::MarketData => &self.market_data_url,
            StreamKind::Portfolio => &self.portfolio_url,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.enable_market_data && !self.enable_portfolio {
            errors.push("at least one of market data or portfolio must be enabled".to_string());
        }
        for kind in StreamKind::ALL {
            if self.is_enabled(kind) && self.url_for(kind).trim().is_empty() {
                errors.push(format!("{} url is empty", kind));
            }
        }
        if self.max_queue_size == 0 {
            errors.push("max_queue_size must be greater than 0".to_string());
        }
        if self.connection_timeout_ms == 0 {
            errors.push("connection_timeout_ms must be greater than 0".to_string());
        }
        if self.heartbeat_interval_ms > 0 && self.pong_timeout_ms >= self.heartbeat_interval_ms {
            errors.push(format!(
                "pong_timeout_ms ({}) must be shorter than heartbeat_interval_ms ({})",
                self.pong_timeout_ms, self.heartbeat_interval_ms
            ));
        }
        if self.reconnect_delay_ms > self.max_reconnect_delay_ms {
            errors.push("reconnect_delay_ms exceeds max_reconnect_delay_ms".to_string());
        }
        if self.subscription_rate_limit == 0 {
            errors.push("subscription_rate_limit must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Per-side settings for the connection state machine
    pub fn connection_config(
        &self,
        kind: StreamKind,
        session: Option<SessionToken>,
    ) -> ConnectionConfig {
        ConnectionConfig {
            name: kind.as_str().to_string(),
            url: self.url_for(kind).to_string(),
            session,
            connect_timeout: Duration::from_millis(self.connection_timeout_ms),
            heartbeat_interval: (self.heartbeat_interval_ms > 0)
                .then(|| Duration::from_millis(self.heartbeat_interval_ms)),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            max_queue_size: self.max_queue_size,
            backoff: BackoffConfig {
                kind: self.backoff,
                initial_delay: Duration::from_millis(self.reconnect_delay_ms),
                max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
                multiplier: 2.0,
                max_attempts: self.max_reconnect_attempts,
                jitter: self.jitter,
            },
            circuit_breaker: self.circuit_breaker.clone(),
        }
    }

    pub fn subscription_rate_limit_config(&self) -> AdaptiveRateLimitConfig {
        AdaptiveRateLimitConfig {
            limit: self.subscription_rate_limit,
            window: Duration::from_millis(self.subscription_rate_window_ms),
            ..Default::default()
        }
    }

    pub fn clock_sync_config(&self) -> ClockSyncConfig {
        ClockSyncConfig {
            max_drift: Duration::from_millis(self.clock_max_drift_ms),
            ..Default::default()
        }
    }
}

/// Pre-obtained session
#[derive(Clone, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub account_id: String,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl SessionConfig {
    pub fn credentials(&self) -> Result<SessionCredentials> {
        if self.token.trim().is_empty() {
            return Err(DxStreamError::Authentication(
                "session token missing (set DXSTREAM__SESSION__TOKEN)".to_string(),
            ));
        }
        Ok(SessionCredentials::new(
            self.token.clone(),
            self.account_id.clone(),
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("DXSTREAM_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (DXSTREAM__SESSION__TOKEN, etc.)
            .add_source(
                Environment::with_prefix("DXSTREAM")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("dxtrade.symbols")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DualStreamConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_errors() {
        let config = DualStreamConfig {
            enable_market_data: false,
            enable_portfolio: false,
            max_queue_size: 0,
            heartbeat_interval_ms: 5_000,
            pong_timeout_ms: 5_000,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);

        let config = DualStreamConfig {
            enable_portfolio: true,
            portfolio_url: " ".to_string(),
            ..Default::default()
        };
        assert_eq!(config.validate().unwrap_err(), vec!["portfolio url is empty"]);
    }

    #[test]
    fn test_connection_config_derivation() {
        let config = DualStreamConfig {
            heartbeat_interval_ms: 0,
            reconnect_delay_ms: 250,
            max_reconnect_attempts: 4,
            ..Default::default()
        };
        let conn = config.connection_config(StreamKind::Portfolio, None);
        assert_eq!(conn.name, "portfolio");
        assert_eq!(conn.url, config.portfolio_url);
        assert_eq!(conn.heartbeat_interval, None);
        assert_eq!(conn.backoff.initial_delay, Duration::from_millis(250));
        assert_eq!(conn.backoff.max_attempts, 4);
    }

    #[test]
    fn test_session_credentials_require_token() {
        let session = SessionConfig::default();
        assert!(matches!(
            session.credentials(),
            Err(DxStreamError::Authentication(_))
        ));

        let session = SessionConfig {
            token: "tok".to_string(),
            account_id: "default:demo".to_string(),
        };
        assert!(!format!("{:?}", session).contains("tok\""));
        assert_eq!(session.credentials().unwrap().account_id, "default:demo");
    }

    #[test]
    fn test_load_from_toml() {
        let dir = std::env::temp_dir().join(format!("dxstream-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.toml"),
            r#"
[dxtrade]
symbols = ["USD/JPY"]
enable_portfolio = false
backoff = "decorrelated"

[dxtrade.circuit_breaker]
failure_threshold = 3

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&dir).unwrap();
        assert_eq!(config.dxtrade.symbols, vec!["USD/JPY"]);
        assert!(!config.dxtrade.enable_portfolio);
        assert_eq!(config.dxtrade.backoff, BackoffKind::Decorrelated);
        assert_eq!(
            config.dxtrade.circuit_breaker.map(|cb| cb.failure_threshold),
            Some(3)
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.dxtrade.max_queue_size, 1_000);

        std::fs::remove_dir_all(&dir).ok();
    }
}
