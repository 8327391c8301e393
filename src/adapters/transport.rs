//! Socket seam for the connection state machine
//!
//! The state machine only sees [`WsFrame`]s flowing through a [`FrameSink`] and
//! a [`FrameStream`]; the concrete websocket library lives behind [`Transport`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

/// Normal closure (explicit disconnect)
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Socket dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Keepalive pong did not arrive in time
pub const CLOSE_PONG_TIMEOUT: u16 = 4000;
/// Server rejected the session
pub const CLOSE_SESSION_REJECTED: u16 = 4001;

/// Close code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// Websocket frame as seen by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

impl WsFrame {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsFrame::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Write half of an open socket
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: WsFrame) -> Result<()>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of an open socket
pub type FrameStream = BoxStream<'static, Result<WsFrame>>;

/// An established socket
pub struct Connected {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

/// Opens sockets
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connected>;
}
