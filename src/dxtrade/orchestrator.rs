//! Dual-stream DXTrade client
//!
//! Owns one [`Connection`] per enabled feed. Each connection gets its own
//! router task translating connection events into [`DualStreamEvent`]s and
//! status updates; the two feeds never call into each other.

use futures::future::join_all;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{DualStreamEvent, StreamErrorKind, StreamKind};
use super::session::{SessionCredentials, SessionToken};
use super::status::DualStreamStatus;
use crate::adapters::{Transport, TungsteniteTransport, CLOSE_SESSION_REJECTED};
use crate::config::DualStreamConfig;
use crate::connection::{Connection, ConnectionEvent, Greeting, EVENT_CHANNEL_CAPACITY};
use crate::coordination::{AdaptiveRateLimiter, ClockSample, ClockSynchronizer};
use crate::error::{DxStreamError, Result};
use crate::protocol::{DxMessage, MessageKind, ParsedMessage};

pub const QUOTES_CHANNEL: &str = "quotes";
pub const CANDLES_CHANNEL: &str = "candles";
pub const PORTFOLIO_CHANNEL: &str = "portfolio";

/// State shared with the router tasks
struct Shared {
    session: SessionToken,
    enable_ping_response: bool,
    status: RwLock<DualStreamStatus>,
    events: broadcast::Sender<DualStreamEvent>,
    limiter: AdaptiveRateLimiter,
    clock: Arc<ClockSynchronizer>,
}

type PendingRouter = (StreamKind, Connection, broadcast::Receiver<ConnectionEvent>);

/// Market data + portfolio streaming client
pub struct DualStreamClient {
    config: DualStreamConfig,
    credentials: SessionCredentials,
    market_data: Option<Connection>,
    portfolio: Option<Connection>,
    shared: Arc<Shared>,
    pending_routers: StdMutex<Vec<PendingRouter>>,
    routers: StdMutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for DualStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualStreamClient")
            .field("account_id", &self.credentials.account_id)
            .field("market_data", &self.market_data)
            .field("portfolio", &self.portfolio)
            .finish()
    }
}

impl DualStreamClient {
    /// Client using the tokio-tungstenite transport
    pub fn new(config: DualStreamConfig, credentials: SessionCredentials) -> Result<Self> {
        let transport = TungsteniteTransport::new(std::time::Duration::from_millis(
            config.connection_timeout_ms,
        ));
        Self::with_transport(config, credentials, Arc::new(transport))
    }

    pub fn with_transport(
        config: DualStreamConfig,
        credentials: SessionCredentials,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| DxStreamError::Validation(errors.join("; ")))?;
        if credentials.token.is_empty() {
            return Err(DxStreamError::Authentication(
                "empty session token".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let clock = Arc::new(ClockSynchronizer::new(config.clock_sync_config()));
        let shared = Arc::new(Shared {
            session: credentials.token.clone(),
            enable_ping_response: config.enable_ping_response,
            status: RwLock::new(DualStreamStatus::new(
                config.enable_market_data,
                config.enable_portfolio,
            )),
            events,
            limiter: AdaptiveRateLimiter::new(config.subscription_rate_limit_config()),
            clock: Arc::clone(&clock),
        });

        let mut pending = Vec::new();
        let mut build = |kind: StreamKind| -> Option<Connection> {
            if !config.is_enabled(kind) {
                debug!("{} stream disabled", kind);
                return None;
            }
            let greeting = session_greeting(credentials.token.clone(), Arc::clone(&clock));
            let connection = Connection::new(
                config.connection_config(kind, Some(credentials.token.clone())),
                Arc::clone(&transport),
                Some(greeting),
            );
            // Subscribe now so no event is missed before the router starts
            pending.push((kind, connection.clone(), connection.subscribe_events()));
            Some(connection)
        };
        let market_data = build(StreamKind::MarketData);
        let portfolio = build(StreamKind::Portfolio);

        Ok(Self {
            config,
            credentials,
            market_data,
            portfolio,
            shared,
            pending_routers: StdMutex::new(pending),
            routers: StdMutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DualStreamConfig {
        &self.config
    }

    /// Subscribe to client events
    pub fn subscribe(&self) -> broadcast::Receiver<DualStreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection(&self, kind: StreamKind) -> Option<&Connection> {
        match kind {
            StreamKind::MarketData => self.market_data.as_ref(),
            StreamKind::Portfolio => self.portfolio.as_ref(),
        }
    }

    fn connections(&self) -> impl Iterator<Item = (StreamKind, &Connection)> {
        StreamKind::ALL
            .into_iter()
            .filter_map(move |kind| self.connection(kind).map(|conn| (kind, conn)))
    }

    pub fn clock(&self) -> &ClockSynchronizer {
        &self.shared.clock
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn start_routers(&self) {
        let pending: Vec<PendingRouter> = match self.pending_routers.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return,
        };
        if pending.is_empty() {
            return;
        }
        let handles: Vec<JoinHandle<()>> = pending
            .into_iter()
            .map(|(kind, conn, rx)| {
                tokio::spawn(run_router(Arc::clone(&self.shared), kind, conn, rx))
            })
            .collect();
        if let Ok(mut routers) = self.routers.lock() {
            routers.extend(handles);
        }
    }

    /// Connect every enabled feed in parallel.
    ///
    /// Returns `true` only if all enabled feeds opened. Failed feeds keep
    /// retrying in the background. Calling this again after a feed exhausted
    /// its reconnect budget clears the exhausted flag and starts over.
    pub async fn connect(&self) -> bool {
        if self.is_destroyed() {
            warn!("connect() on destroyed client");
            return false;
        }
        self.start_routers();

        {
            let mut status = self.shared.status.write().await;
            for (kind, _) in self.connections() {
                status.side_mut(kind).exhausted = false;
            }
        }

        let attempts = self.connections().map(|(kind, conn)| async move {
            let result = conn.connect().await;
            (kind, result)
        });
        let results = join_all(attempts).await;

        let mut all_ok = true;
        for (kind, result) in results {
            if let Err(e) = result {
                all_ok = false;
                error!("{} connect failed: {}", kind, e);
                let _ = self.shared.events.send(DualStreamEvent::Error {
                    stream: kind,
                    kind: StreamErrorKind::Connection,
                    message: e.to_string(),
                });
            }
        }

        for (kind, conn) in self.connections() {
            self.shared.refresh(kind, conn).await;
        }
        if all_ok {
            info!("All enabled streams connected");
        }
        all_ok
    }

    /// Close every feed with a normal code. Idempotent.
    pub async fn disconnect(&self) {
        join_all(self.connections().map(|(_, conn)| conn.disconnect())).await;
        for (kind, conn) in self.connections() {
            self.shared.refresh(kind, conn).await;
        }
        info!("Dual-stream client disconnected");
    }

    /// Disconnect, drop all subscriptions and stop routing. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        join_all(self.connections().map(|(_, conn)| conn.destroy())).await;
        for (kind, conn) in self.connections() {
            self.shared.refresh(kind, conn).await;
        }
        if let Ok(mut routers) = self.routers.lock() {
            for handle in routers.drain(..) {
                handle.abort();
            }
        }
        info!("Dual-stream client destroyed");
    }

    fn account(&self) -> &str {
        if self.config.account_id.is_empty() {
            &self.credentials.account_id
        } else {
            &self.config.account_id
        }
    }

    fn market_data_payloads(&self, symbols: &[String]) -> (Value, Value) {
        let quotes = json!({
            "account": self.account(),
            "symbols": symbols,
            "eventTypes": [{"type": "Quote", "format": "COMPACT"}],
        });
        let candles = json!({
            "account": self.account(),
            "symbols": symbols,
            "eventTypes": [{
                "type": "Candle",
                "candleType": self.config.candle_type,
                "format": "COMPACT",
            }],
        });
        (quotes, candles)
    }

    fn require(&self, kind: StreamKind) -> Result<&Connection> {
        if self.is_destroyed() {
            return Err(DxStreamError::Destroyed);
        }
        self.connection(kind)
            .ok_or_else(|| DxStreamError::InvalidState(format!("{} stream is disabled", kind)))
    }

    /// Subscribe to quotes and candles for `symbols` (configured default when empty).
    ///
    /// Returns `true` when both requests went out now; otherwise they are
    /// sent when the market data socket opens.
    pub async fn subscribe_to_market_data(&self, symbols: &[String]) -> Result<bool> {
        let conn = self.require(StreamKind::MarketData)?;
        let symbols: Vec<String> = if symbols.is_empty() {
            self.config.symbols.clone()
        } else {
            symbols.to_vec()
        };
        if symbols.is_empty() {
            return Err(DxStreamError::Validation("no symbols to subscribe".to_string()));
        }

        // Quotes and candles are admitted as a pair
        self.shared.limiter.consume_n(2)?;

        let (quotes, candles) = self.market_data_payloads(&symbols);
        let quotes_sent = conn
            .subscribe(
                QUOTES_CHANNEL,
                MessageKind::MarketDataSubscriptionRequest,
                &symbols,
                quotes,
            )
            .await?;
        let candles_sent = conn
            .subscribe(
                CANDLES_CHANNEL,
                MessageKind::MarketDataSubscriptionRequest,
                &symbols,
                candles,
            )
            .await?;

        info!(
            "Market data subscription for {} symbols ({})",
            symbols.len(),
            if quotes_sent && candles_sent { "sent" } else { "pending open" }
        );
        self.shared.refresh(StreamKind::MarketData, conn).await;
        Ok(quotes_sent && candles_sent)
    }

    /// Drop the quote and candle subscriptions for `symbols`.
    ///
    /// While open, an empty-symbol request replaces the server-side
    /// subscription. Returns whether any template existed.
    pub async fn unsubscribe_from_market_data(&self, symbols: &[String]) -> Result<bool> {
        let conn = self.require(StreamKind::MarketData)?;
        let symbols: Vec<String> = if symbols.is_empty() {
            self.config.symbols.clone()
        } else {
            symbols.to_vec()
        };

        let quotes_removed = conn.unsubscribe(QUOTES_CHANNEL, &symbols);
        let candles_removed = conn.unsubscribe(CANDLES_CHANNEL, &symbols);
        if !(quotes_removed || candles_removed) {
            return Ok(false);
        }

        let (quotes, candles) = self.market_data_payloads(&[]);
        for payload in [quotes, candles] {
            let request = DxMessage::subscription_request(
                MessageKind::MarketDataSubscriptionRequest,
                &uuid::Uuid::new_v4().to_string(),
                self.credentials.token.expose(),
                payload,
            )
            .ok_or_else(|| DxStreamError::Internal("market data request".to_string()))?;
            conn.send_now(request.to_json()?).await?;
        }

        self.shared.refresh(StreamKind::MarketData, conn).await;
        Ok(true)
    }

    /// Subscribe to all accounts' portfolio events with offset.
    pub async fn subscribe_to_portfolio_data(&self) -> Result<bool> {
        let conn = self.require(StreamKind::Portfolio)?;
        self.shared.limiter.consume()?;

        let sent = conn
            .subscribe(
                PORTFOLIO_CHANNEL,
                MessageKind::AccountPortfoliosSubscriptionRequest,
                &[],
                json!({"accounts": ["ALL"], "withOffset": true}),
            )
            .await?;
        info!(
            "Portfolio subscription {}",
            if sent { "sent" } else { "pending open" }
        );
        self.shared.refresh(StreamKind::Portfolio, conn).await;
        Ok(sent)
    }

    pub async fn get_status(&self) -> DualStreamStatus {
        self.shared.status.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.shared.status.read().await.is_ready
    }

    /// Server keepalive response rate is at least 90%
    pub async fn is_stable(&self) -> bool {
        self.shared.status.read().await.ping_stats.is_stable()
    }

    /// Estimate the server clock offset; later greeting `Ping`s use server time.
    pub async fn sync_clock<F, Fut>(&self, fetch_server_time: F) -> Result<ClockSample>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<i64>>,
    {
        self.shared.clock.sync(fetch_server_time).await
    }
}

impl Drop for DualStreamClient {
    fn drop(&mut self) {
        // Routers hold connection handles; stop them with the client
        if let Ok(mut routers) = self.routers.lock() {
            for handle in routers.drain(..) {
                handle.abort();
            }
        }
    }
}

/// First frame on every socket: `Ping` with the session token
fn session_greeting(session: SessionToken, clock: Arc<ClockSynchronizer>) -> Greeting {
    Arc::new(move || {
        DxMessage::ping(session.expose(), clock.server_time_ms())
            .to_json()
            .ok()
    })
}

async fn run_router(
    shared: Arc<Shared>,
    kind: StreamKind,
    conn: Connection,
    mut rx: broadcast::Receiver<ConnectionEvent>,
) {
    debug!("{} router started", kind);
    loop {
        match rx.recv().await {
            Ok(event) => shared.handle_event(kind, &conn, event).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("{} router lagged, skipped {} events", kind, skipped);
                shared.refresh(kind, &conn).await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("{} router stopped", kind);
}

impl Shared {
    fn emit(&self, event: DualStreamEvent) {
        let _ = self.events.send(event);
    }

    /// Re-read connection state into the status and recompute readiness.
    async fn refresh(&self, kind: StreamKind, conn: &Connection) {
        let state = conn.state().await;
        let subscriptions_active = conn.all_subscriptions_active();
        let attempts = conn.reconnect_attempts();

        let changed = {
            let mut status = self.status.write().await;
            let side = status.side_mut(kind);
            side.connected = state.is_open();
            if !side.connected {
                side.authenticated = false;
            }
            side.subscribed = side.connected && subscriptions_active;
            side.reconnect_attempts = attempts;
            status.refresh_ready()
        };

        if let Some(ready) = changed {
            info!("Dual-stream ready: {}", ready);
            self.emit(DualStreamEvent::ReadyChanged { ready });
        }
    }

    async fn mark_authenticated(&self, kind: StreamKind) {
        let newly = {
            let mut status = self.status.write().await;
            let side = status.side_mut(kind);
            let newly = side.connected && !side.authenticated;
            if side.connected {
                side.authenticated = true;
            }
            newly
        };
        if newly {
            info!("{} session authenticated", kind);
            self.emit(DualStreamEvent::Authenticated { stream: kind });
        }
    }

    async fn handle_event(&self, kind: StreamKind, conn: &Connection, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { .. } => self.refresh(kind, conn).await,
            ConnectionEvent::Opened { reconnected } => {
                self.status.write().await.side_mut(kind).exhausted = false;
                self.refresh(kind, conn).await;
                self.emit(DualStreamEvent::Connected { stream: kind });
                if reconnected {
                    self.emit(DualStreamEvent::Reconnected { stream: kind });
                }
            }
            ConnectionEvent::Closed { code, reason } => {
                self.refresh(kind, conn).await;
                self.emit(DualStreamEvent::Disconnected {
                    stream: kind,
                    code,
                    reason,
                });
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                self.status.write().await.side_mut(kind).reconnect_attempts = attempt;
                self.emit(DualStreamEvent::Reconnecting {
                    stream: kind,
                    attempt,
                    delay,
                });
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                self.status.write().await.side_mut(kind).exhausted = true;
                self.refresh(kind, conn).await;
                let err = DxStreamError::ReconnectExhausted {
                    connection: kind.to_string(),
                    attempts,
                };
                self.emit(DualStreamEvent::Error {
                    stream: kind,
                    kind: StreamErrorKind::ReconnectExhausted,
                    message: err.to_string(),
                });
            }
            ConnectionEvent::Raw(text) => self.emit(DualStreamEvent::Raw { stream: kind, text }),
            ConnectionEvent::Message(parsed) => self.handle_message(kind, conn, &parsed).await,
            ConnectionEvent::ProtocolError { error, raw_preview } => {
                self.emit(DualStreamEvent::Error {
                    stream: kind,
                    kind: StreamErrorKind::Protocol,
                    message: format!("{} ({})", error, raw_preview),
                });
            }
            ConnectionEvent::Error(message) => self.emit(DualStreamEvent::Error {
                stream: kind,
                kind: StreamErrorKind::Connection,
                message,
            }),
        }
    }

    async fn handle_message(&self, kind: StreamKind, conn: &Connection, parsed: &ParsedMessage) {
        self.status.write().await.side_mut(kind).message_count += 1;

        match &parsed.message {
            DxMessage::Pong(_) => self.mark_authenticated(kind).await,
            DxMessage::PingRequest(request) => self.answer_ping(kind, conn, request.timestamp).await,
            DxMessage::SubscriptionResponse(response) => {
                if response.success {
                    self.limiter.record_success();
                    self.mark_authenticated(kind).await;
                } else {
                    self.limiter.record_error();
                    warn!(
                        "{} subscription {} rejected: {}",
                        kind,
                        response.request_id,
                        response.error.as_deref().unwrap_or("no reason given")
                    );
                }
                self.refresh(kind, conn).await;
                self.emit(DualStreamEvent::SubscriptionResponse {
                    stream: kind,
                    response: response.clone(),
                });
            }
            DxMessage::MarketData(data)
            | DxMessage::AccountPortfolios(data)
            | DxMessage::PositionUpdate(data)
            | DxMessage::OrderUpdate(data) => {
                self.mark_authenticated(kind).await;
                let data = Arc::new(data.clone());
                self.emit(match parsed.message.kind() {
                    MessageKind::MarketData => DualStreamEvent::MarketData(data),
                    MessageKind::AccountPortfolios => DualStreamEvent::Portfolio(data),
                    MessageKind::PositionUpdate => DualStreamEvent::PositionUpdate(data),
                    _ => DualStreamEvent::OrderUpdate(data),
                });
            }
            DxMessage::Reject(reject) => {
                let reason = reject
                    .reason
                    .clone()
                    .unwrap_or_else(|| "session rejected".to_string());
                error!("{} session rejected: {}", kind, reason);
                self.status.write().await.side_mut(kind).authenticated = false;
                self.emit(DualStreamEvent::Error {
                    stream: kind,
                    kind: StreamErrorKind::Authentication,
                    message: DxStreamError::Authentication(reason.clone()).to_string(),
                });
                // Fatal for this socket only; the next reconnect retries the same token
                conn.fail(CLOSE_SESSION_REJECTED, &reason).await;
            }
            DxMessage::Error(err) => {
                let message = err
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified server error".to_string());
                warn!("{} server error: {}", kind, message);
                self.emit(DualStreamEvent::Error {
                    stream: kind,
                    kind: StreamErrorKind::Server,
                    message,
                });
            }
            DxMessage::Ping(_)
            | DxMessage::MarketDataSubscriptionRequest(_)
            | DxMessage::AccountPortfoliosSubscriptionRequest(_) => {
                debug!("{} ignoring echoed {}", kind, parsed.message.kind());
            }
        }
    }

    async fn answer_ping(&self, kind: StreamKind, conn: &Connection, timestamp: i64) {
        if self.clock.has_synced() {
            if let Err(e) = self.clock.validate_timestamp(timestamp) {
                warn!("{} PingRequest timestamp: {}", kind, e);
            }
        }

        let responded = if self.enable_ping_response {
            match DxMessage::ping(self.session.expose(), timestamp).to_json() {
                Ok(text) => match conn.send_now(text).await {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!("{} ping response failed: {}", kind, e);
                        false
                    }
                },
                Err(e) => {
                    warn!("{} ping response not serialized: {}", kind, e);
                    false
                }
            }
        } else {
            false
        };

        {
            let mut status = self.status.write().await;
            status.ping_stats.requests_received += 1;
            if responded {
                status.ping_stats.responses_sent += 1;
            }
        }
        debug!(
            "{} PingRequest {} answered: {}",
            kind, timestamp, responded
        );
        self.emit(DualStreamEvent::PingRequest {
            stream: kind,
            timestamp,
            responded,
        });
    }
}
