//! In-memory transport
//!
//! Every `connect` creates a pair of unbounded channels and hands the server
//! end to [`ChannelServer::accept`]. Used to replay scripted broker sessions in
//! fixtures and tests without touching the network.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::transport::{CloseInfo, Connected, FrameSink, Transport, WsFrame};
use crate::error::{DxStreamError, Result};

#[derive(Debug, Default)]
struct Script {
    refusals: Mutex<VecDeque<String>>,
    refuse_all: AtomicBool,
    connects: AtomicUsize,
}

/// Client side, handed to the connection state machine
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    accept_tx: mpsc::UnboundedSender<ServerSession>,
    script: Arc<Script>,
}

/// Server side, owned by the test or fixture
#[derive(Debug)]
pub struct ChannelServer {
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSession>>,
    script: Arc<Script>,
}

/// Create a connected transport/server pair
pub fn channel_transport() -> (ChannelTransport, ChannelServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let script = Arc::new(Script::default());
    (
        ChannelTransport {
            accept_tx,
            script: Arc::clone(&script),
        },
        ChannelServer {
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            script,
        },
    )
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<WsFrame>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: WsFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| DxStreamError::Connection("peer closed the channel".to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let _ = self
            .tx
            .send(WsFrame::Close(Some(CloseInfo::new(code, reason))));
        Ok(())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, url: &str) -> Result<Connected> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);

        if self.script.refuse_all.load(Ordering::SeqCst) {
            return Err(DxStreamError::Connection(format!("{} refused", url)));
        }
        let refusal = self
            .script
            .refusals
            .lock()
            .map_err(|_| DxStreamError::Internal("script lock poisoned".to_string()))?
            .pop_front();
        if let Some(reason) = refusal {
            return Err(DxStreamError::Connection(reason));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<Result<WsFrame>>();

        let session = ServerSession {
            url: url.to_string(),
            from_client: server_rx,
            to_client: Some(server_tx),
        };
        self.accept_tx
            .send(session)
            .map_err(|_| DxStreamError::Connection("channel server dropped".to_string()))?;
        debug!("Channel transport accepted connection to {}", url);

        let stream = futures::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(Connected {
            sink: Box::new(ChannelSink { tx: client_tx }),
            stream,
        })
    }
}

impl ChannelServer {
    /// Wait for the next client connection.
    pub async fn accept(&self) -> Option<ServerSession> {
        self.accept_rx.lock().await.recv().await
    }

    /// Wait for the next client connection, up to `wait`.
    pub async fn accept_timeout(&self, wait: Duration) -> Option<ServerSession> {
        tokio::time::timeout(wait, self.accept()).await.ok().flatten()
    }

    /// Refuse the next connection attempt with `reason`.
    pub fn refuse_next(&self, reason: &str) {
        if let Ok(mut refusals) = self.script.refusals.lock() {
            refusals.push_back(reason.to_string());
        }
    }

    /// Refuse every connection attempt until called with `false`.
    pub fn refuse_all(&self, refuse: bool) {
        self.script.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }
}

/// Server end of one accepted connection
#[derive(Debug)]
pub struct ServerSession {
    pub url: String,
    from_client: mpsc::UnboundedReceiver<WsFrame>,
    to_client: Option<mpsc::UnboundedSender<Result<WsFrame>>>,
}

impl ServerSession {
    pub fn send_frame(&self, frame: WsFrame) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(Ok(frame)).is_ok())
            .unwrap_or(false)
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send_frame(WsFrame::Text(text.to_string()))
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(&value.to_string())
    }

    /// Deliver a transport error to the client reader
    pub fn send_error(&self, reason: &str) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(Err(DxStreamError::Connection(reason.to_string()))).is_ok())
            .unwrap_or(false)
    }

    /// Send a close frame and stop talking to the client.
    pub fn close(&mut self, code: u16, reason: &str) {
        self.send_frame(WsFrame::Close(Some(CloseInfo::new(code, reason))));
        self.to_client = None;
    }

    /// Drop the connection without a close frame (client sees 1006).
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }

    /// Next frame from the client, any kind.
    pub async fn recv(&mut self) -> Option<WsFrame> {
        self.from_client.recv().await
    }

    /// Next text frame from the client, skipping control frames.
    ///
    /// Returns `None` on a client close frame or when the client is gone.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_client.recv().await? {
                WsFrame::Text(text) => return Some(text),
                WsFrame::Close(_) => return None,
                WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
            }
        }
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Like [`recv_json`](Self::recv_json), giving up after `wait`.
    pub async fn recv_json_timeout(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.recv_json()).await.ok().flatten()
    }

    /// Text frames already buffered, without waiting.
    pub fn drain_text(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            if let WsFrame::Text(text) = frame {
                out.push(text);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_round_trip_frames() {
        let (transport, server) = channel_transport();
        let mut connected = transport.connect("ws://broker.test/md").await.unwrap();
        let mut session = server.accept().await.unwrap();
        assert_eq!(session.url, "ws://broker.test/md");

        connected
            .sink
            .send(WsFrame::Text("{\"type\":\"Ping\"}".into()))
            .await
            .unwrap();
        assert_eq!(session.recv_text().await.unwrap(), "{\"type\":\"Ping\"}");

        session.send_text("hello");
        let frame = connected.stream.next().await.unwrap().unwrap();
        assert_eq!(frame, WsFrame::Text("hello".into()));

        session.drop_connection();
        assert!(connected.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_scripted_refusals() {
        let (transport, server) = channel_transport();
        server.refuse_next("maintenance");
        assert!(transport.connect("ws://x").await.is_err());
        assert!(transport.connect("ws://x").await.is_ok());

        server.refuse_all(true);
        assert!(transport.connect("ws://x").await.is_err());
        assert_eq!(server.connect_attempts(), 3);
    }
}
