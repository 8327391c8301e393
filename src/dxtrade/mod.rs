//! DXTrade dual-stream client
//!
//! Market data and portfolio feeds run on independent [`Connection`](crate::connection::Connection)s
//! and are merged into one event stream plus an aggregate readiness status.

pub mod events;
pub mod orchestrator;
pub mod session;
pub mod status;

pub use events::{DualStreamEvent, StreamErrorKind, StreamKind};
pub use orchestrator::{DualStreamClient, CANDLES_CHANNEL, PORTFOLIO_CHANNEL, QUOTES_CHANNEL};
pub use session::{SessionCredentials, SessionToken};
pub use status::{ConnectionStatus, DualStreamStatus, PingStats, STABLE_RESPONSE_RATE};
