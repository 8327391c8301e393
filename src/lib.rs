pub mod adapters;
pub mod cli;
pub mod config;
pub mod connection;
pub mod coordination;
pub mod dxtrade;
pub mod error;
pub mod protocol;

pub use adapters::{channel_transport, ChannelServer, ChannelTransport, Transport, TungsteniteTransport};
pub use config::AppConfig;
pub use connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
pub use coordination::{CircuitBreaker, CircuitState, ClockSynchronizer};
pub use dxtrade::{
    DualStreamClient, DualStreamEvent, DualStreamStatus, SessionCredentials, SessionToken,
    StreamKind,
};
pub use error::{DxStreamError, Result};
pub use protocol::{DxMessage, MessageKind};
