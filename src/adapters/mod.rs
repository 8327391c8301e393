pub mod channel_ws;
pub mod transport;
pub mod tungstenite_ws;

pub use channel_ws::{channel_transport, ChannelServer, ChannelTransport, ServerSession};
pub use transport::{
    CloseInfo, Connected, FrameSink, FrameStream, Transport, WsFrame, CLOSE_ABNORMAL,
    CLOSE_NORMAL, CLOSE_NO_STATUS, CLOSE_PONG_TIMEOUT, CLOSE_SESSION_REJECTED,
};
pub use tungstenite_ws::TungsteniteTransport;
