//! tokio-tungstenite transport
//!
//! Connects directly, or through an HTTP CONNECT proxy when one is configured
//! in the environment. An HTTP 429 on the upgrade is surfaced as
//! [`DxStreamError::RateLimited`] with the server's retry hint.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::transport::{CloseInfo, Connected, FrameSink, Transport, WsFrame, CLOSE_NO_STATUS};
use crate::coordination::retry_after_from_headers;
use crate::error::{DxStreamError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Environment variables consulted for a tunnel, first match wins.
const PROXY_ENV_VARS: [&str; 3] = ["HTTPS_PROXY", "HTTP_PROXY", "ALL_PROXY"];

/// HTTP CONNECT proxy
///
/// The address may omit the scheme (`proxy.local:3128`) and defaults to port
/// 8080. Only the uppercase variable names are honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HttpProxy {
    host: String,
    port: u16,
}

impl HttpProxy {
    fn from_env() -> Option<Self> {
        PROXY_ENV_VARS
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
            .and_then(|value| Self::parse(&value))
    }

    fn parse(address: &str) -> Option<Self> {
        let address = address.trim();
        let url = if address.contains("://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("http://{}", address))
        }
        .ok()?;

        Some(Self {
            host: url.host_str()?.to_string(),
            port: url.port().unwrap_or(8080),
        })
    }

    /// Open a TCP tunnel to `host:port`, ready for TLS or a plain upgrade.
    async fn tunnel(&self, host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
        debug!(
            "Tunnelling to {}:{} via proxy {}:{}",
            host, port, self.host, self.port
        );

        let address = format!("{}:{}", self.host, self.port);
        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| DxStreamError::Timeout(format!("proxy {} did not accept in time", address)))?
            .map_err(|e| DxStreamError::Connection(format!("proxy {} unreachable: {}", address, e)))?;

        let (reader, mut writer) = stream.into_split();
        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: keep-alive\r\n\r\n"
        );
        writer
            .write_all(request.as_bytes())
            .await
            .map_err(|e| DxStreamError::Connection(format!("proxy CONNECT write: {}", e)))?;

        let mut reader = BufReader::new(reader);
        let mut status_line = String::new();
        reader
            .read_line(&mut status_line)
            .await
            .map_err(|e| DxStreamError::Connection(format!("proxy CONNECT read: {}", e)))?;
        if connect_status(&status_line) != Some(200) {
            return Err(DxStreamError::Connection(format!(
                "proxy refused CONNECT: {}",
                status_line.trim()
            )));
        }

        // Skip response headers up to the blank line
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| DxStreamError::Connection(format!("proxy CONNECT read: {}", e)))?;
            if read == 0 || line.trim().is_empty() {
                break;
            }
        }

        reader
            .into_inner()
            .reunite(writer)
            .map_err(|e| DxStreamError::Internal(format!("proxy stream reunite: {}", e)))
    }
}

/// Status code of an HTTP status line such as `HTTP/1.1 200 Connection established`.
fn connect_status(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    parts.next().filter(|version| version.starts_with("HTTP/"))?;
    parts.next()?.parse().ok()
}

/// Map handshake errors, pulling the retry hint out of a 429 response.
fn map_handshake_error(err: tungstenite::Error) -> DxStreamError {
    if let tungstenite::Error::Http(response) = &err {
        if response.status().as_u16() == 429 {
            let retry_after =
                retry_after_from_headers(response.headers()).unwrap_or(Duration::from_secs(1));
            return DxStreamError::RateLimited { retry_after };
        }
    }
    DxStreamError::WebSocket(err)
}

fn from_message(message: Message) -> Option<WsFrame> {
    match message {
        Message::Text(text) => Some(WsFrame::Text(text)),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(WsFrame::Text(text)),
            Err(_) => {
                warn!("Dropping non-UTF-8 binary frame");
                None
            }
        },
        Message::Ping(data) => Some(WsFrame::Ping(data)),
        Message::Pong(data) => Some(WsFrame::Pong(data)),
        Message::Close(frame) => Some(WsFrame::Close(Some(match frame {
            Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.into_owned()),
            None => CloseInfo::new(CLOSE_NO_STATUS, ""),
        }))),
        Message::Frame(_) => None,
    }
}

fn to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::Text(text),
        WsFrame::Ping(data) => Message::Ping(data),
        WsFrame::Pong(data) => Message::Pong(data),
        WsFrame::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

struct TungsteniteSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: WsFrame) -> Result<()> {
        self.inner.send(to_message(frame)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = WsFrame::Close(Some(CloseInfo::new(code, reason)));
        // Peer may already be gone; closing is best effort
        if let Err(e) = self.inner.send(to_message(frame)).await {
            debug!("Close frame not delivered: {}", e);
        }
        self.inner.close().await?;
        Ok(())
    }
}

/// Production transport backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    connect_timeout: Duration,
    use_proxy: bool,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TungsteniteTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            use_proxy: true,
        }
    }

    /// Ignore proxy environment variables
    pub fn without_proxy(mut self) -> Self {
        self.use_proxy = false;
        self
    }

    async fn open(&self, url: &Url) -> Result<WsStream> {
        let host = url
            .host_str()
            .ok_or_else(|| DxStreamError::Validation("No host in URL".to_string()))?;
        let secure = url.scheme() == "wss";
        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        if self.use_proxy {
            if let Some(proxy) = HttpProxy::from_env() {
                info!("Using proxy {}:{} for {}", proxy.host, proxy.port, host);

                let tcp_stream = proxy.tunnel(host, port, self.connect_timeout).await?;

                let maybe_tls = if secure {
                    let connector = native_tls::TlsConnector::new().map_err(|e| {
                        DxStreamError::Connection(format!("TLS connector error: {}", e))
                    })?;
                    let connector = tokio_native_tls::TlsConnector::from(connector);
                    let tls_stream = connector.connect(host, tcp_stream).await.map_err(|e| {
                        DxStreamError::Connection(format!("TLS handshake failed: {}", e))
                    })?;
                    MaybeTlsStream::NativeTls(tls_stream)
                } else {
                    MaybeTlsStream::Plain(tcp_stream)
                };

                let (ws_stream, _response) =
                    timeout(self.connect_timeout, tokio_tungstenite::client_async(url.as_str(), maybe_tls))
                        .await
                        .map_err(|_| {
                            DxStreamError::Timeout("WebSocket handshake timeout".to_string())
                        })?
                        .map_err(map_handshake_error)?;

                return Ok(ws_stream);
            }
        }

        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| DxStreamError::Timeout("WebSocket connection timeout".to_string()))?
            .map_err(map_handshake_error)?;

        Ok(ws_stream)
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Connected> {
        let url = Url::parse(url)
            .map_err(|e| DxStreamError::Validation(format!("Invalid WebSocket URL: {}", e)))?;

        let ws_stream = self.open(&url).await?;
        let (write, read) = ws_stream.split();

        let stream = read
            .filter_map(|item| {
                futures::future::ready(match item {
                    Ok(message) => from_message(message).map(Ok),
                    Err(e) => Some(Err(DxStreamError::WebSocket(e))),
                })
            })
            .boxed();

        Ok(Connected {
            sink: Box::new(TungsteniteSink { inner: write }),
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(host: &str, port: u16) -> HttpProxy {
        HttpProxy {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_proxy_address_forms() {
        assert_eq!(
            HttpProxy::parse("http://proxy.local:3128"),
            Some(proxy("proxy.local", 3128))
        );
        assert_eq!(HttpProxy::parse(" proxy.local "), Some(proxy("proxy.local", 8080)));
        assert_eq!(HttpProxy::parse("http://"), None);
    }

    #[test]
    fn test_connect_status_line() {
        assert_eq!(connect_status("HTTP/1.1 200 Connection established\r\n"), Some(200));
        assert_eq!(connect_status("HTTP/1.0 407 Proxy Authentication Required"), Some(407));
        // A 200 buried in the reason phrase is not a success
        assert_eq!(connect_status("HTTP/1.1 502 upstream 200"), Some(502));
        assert_eq!(connect_status("garbage"), None);
    }

    async fn fake_proxy(reply: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut reader = BufReader::new(reader);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).await.unwrap();
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line.trim().is_empty() {
                    break;
                }
            }
            writer.write_all(reply.as_bytes()).await.unwrap();
            request_line
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_tunnel_through_proxy() {
        let (port, server) =
            fake_proxy("HTTP/1.1 200 Connection established\r\nVia: test\r\n\r\n").await;
        let stream = proxy("127.0.0.1", port)
            .tunnel("broker.test", 443, Duration::from_secs(2))
            .await;
        assert!(stream.is_ok());
        assert_eq!(
            server.await.unwrap().trim(),
            "CONNECT broker.test:443 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn test_tunnel_refused_by_proxy() {
        let (port, _server) =
            fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let result = proxy("127.0.0.1", port)
            .tunnel("broker.test", 443, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(DxStreamError::Connection(msg)) if msg.contains("407")));
    }

    #[test]
    fn test_close_frame_mapping() {
        let frame = from_message(Message::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "bye".into(),
        })));
        assert_eq!(frame, Some(WsFrame::Close(Some(CloseInfo::new(1001, "bye")))));

        let frame = from_message(Message::Close(None));
        assert_eq!(
            frame,
            Some(WsFrame::Close(Some(CloseInfo::new(CLOSE_NO_STATUS, ""))))
        );

        match to_message(WsFrame::Close(Some(CloseInfo::new(1000, "done")))) {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1000),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_binary_text_frames() {
        assert_eq!(
            from_message(Message::Binary(b"{\"type\":\"Pong\"}".to_vec())),
            Some(WsFrame::Text("{\"type\":\"Pong\"}".to_string()))
        );
        assert_eq!(from_message(Message::Binary(vec![0xff, 0xfe])), None);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let transport = TungsteniteTransport::default().without_proxy();
        let result = transport.connect("not a url").await;
        assert!(matches!(result, Err(DxStreamError::Validation(_))));
    }
}
