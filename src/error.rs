use std::time::Duration;
use thiserror::Error;

/// Main error type for the streaming client
#[derive(Error, Debug)]
pub enum DxStreamError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection timeout: {0}")]
    Timeout(String),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("Reconnect attempts exhausted for {connection} after {attempts} attempts")]
    ReconnectExhausted { connection: String, attempts: u32 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Clock drift {drift_ms}ms exceeds {max_drift_ms}ms")]
    ClockDrift { drift_ms: i64, max_drift_ms: i64 },

    // State machine errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Client destroyed")]
    Destroyed,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DxStreamError {
    /// Whether a retry (after backoff) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DxStreamError::WebSocket(_)
                | DxStreamError::Connection(_)
                | DxStreamError::Timeout(_)
                | DxStreamError::RateLimited { .. }
                | DxStreamError::CircuitOpen { .. }
                | DxStreamError::Io(_)
        )
    }

    /// Server- or breaker-imposed wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DxStreamError::RateLimited { retry_after }
            | DxStreamError::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Result type alias for DxStreamError
pub type Result<T> = std::result::Result<T, DxStreamError>;
