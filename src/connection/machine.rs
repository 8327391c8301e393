//! Connection state machine
//!
//! Every opened socket gets a fresh epoch. The reader and heartbeat tasks of
//! that socket carry the epoch and close paths compare-and-swap it, so a close
//! reported twice (reader sees EOF while the heartbeat times out) or reported
//! after `disconnect()` is ignored.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::OutboundQueue;
use super::state::{ConnectionEvent, ConnectionState, ConnectionStats, SendOutcome, StatsCounters};
use super::subscription::{Subscription, SubscriptionKey};
use super::ConnectionConfig;
use crate::adapters::{
    CloseInfo, Connected, FrameSink, FrameStream, Transport, WsFrame, CLOSE_ABNORMAL,
    CLOSE_NORMAL, CLOSE_NO_STATUS, CLOSE_PONG_TIMEOUT,
};
use crate::coordination::{BackoffStrategy, CircuitBreaker};
use crate::error::{DxStreamError, Result};
use crate::protocol::router::RAW_PREVIEW_LEN;
use crate::protocol::{parse_inbound, route, truncate_payload, DxMessage, MessageKind, Route};

pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Produces the first text frame sent on every new socket
pub type Greeting = Arc<dyn Fn() -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    /// Caller `connect()`; failures are returned
    Initial,
    /// Triggered by `send()` while idle or closed
    Implicit,
    /// Scheduled by the backoff timer
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Reader,
    Heartbeat,
    Caller,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    /// Store the tasks of a fresh socket, aborting any left from the previous one.
    fn install(&mut self, reader: JoinHandle<()>, heartbeat: Option<JoinHandle<()>>) {
        if let Some(stale) = self.reader.replace(reader) {
            stale.abort();
        }
        if let Some(stale) = std::mem::replace(&mut self.heartbeat, heartbeat) {
            stale.abort();
        }
    }

    /// Abort socket tasks, except the one doing the closing.
    fn abort_io(&mut self, origin: Origin) {
        if let Some(handle) = self.reader.take() {
            if origin != Origin::Reader {
                handle.abort();
            }
        }
        if let Some(handle) = self.heartbeat.take() {
            if origin != Origin::Heartbeat {
                handle.abort();
            }
        }
    }

    fn abort_all(&mut self) {
        self.abort_io(Origin::Caller);
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    greeting: Option<Greeting>,
    state: RwLock<ConnectionState>,
    epoch: AtomicU64,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    queue: Mutex<OutboundQueue>,
    subscriptions: DashMap<SubscriptionKey, Subscription>,
    backoff: StdMutex<Box<dyn BackoffStrategy>>,
    breaker: Option<Arc<CircuitBreaker>>,
    reconnect_attempts: AtomicU32,
    destroyed: AtomicBool,
    manual_close: AtomicBool,
    has_opened: AtomicBool,
    implicit_connect: AtomicBool,
    tasks: StdMutex<Tasks>,
    last_pong: StdMutex<Instant>,
    events: broadcast::Sender<ConnectionEvent>,
    stats: StatsCounters,
}

/// Handle to a resilient websocket connection; clones share the same socket
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.config.name)
            .field("url", &self.inner.config.url)
            .finish()
    }
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        greeting: Option<Greeting>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let breaker = config
            .circuit_breaker
            .clone()
            .map(|cb| Arc::new(CircuitBreaker::new(config.name.clone(), cb)));
        let backoff = config.backoff.build();
        let queue = OutboundQueue::new(config.max_queue_size);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                greeting,
                state: RwLock::new(ConnectionState::Idle),
                epoch: AtomicU64::new(0),
                sink: Mutex::new(None),
                queue: Mutex::new(queue),
                subscriptions: DashMap::new(),
                backoff: StdMutex::new(backoff),
                breaker,
                reconnect_attempts: AtomicU32::new(0),
                destroyed: AtomicBool::new(false),
                manual_close: AtomicBool::new(false),
                has_opened: AtomicBool::new(false),
                implicit_connect: AtomicBool::new(false),
                tasks: StdMutex::new(Tasks::default()),
                last_pong: StdMutex::new(Instant::now()),
                events,
                stats: StatsCounters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Subscribe to connection events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await.is_open()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    pub fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        self.inner.breaker.clone()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Queued outbound texts, oldest first
    pub async fn queued_messages(&self) -> Vec<String> {
        self.inner.queue.lock().await.texts()
    }

    /// Subscription templates, ordered by key
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        subs.sort_by(|a, b| a.key.cmp(&b.key));
        subs
    }

    /// True when at least one subscription exists and all are acknowledged
    pub fn all_subscriptions_active(&self) -> bool {
        !self.inner.subscriptions.is_empty()
            && self.inner.subscriptions.iter().all(|entry| entry.active)
    }

    /// Open the socket.
    ///
    /// No-op while connecting or open. A failed handshake moves to `Error`,
    /// schedules a reconnect if the budget allows, and returns the error.
    pub async fn connect(&self) -> Result<()> {
        self.inner.open(OpenKind::Initial).await
    }

    /// Send a text frame, queueing it while the socket is not open.
    ///
    /// Queueing while idle or closed also starts a connection attempt.
    pub async fn send(&self, text: impl Into<String>) -> Result<SendOutcome> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(DxStreamError::Destroyed);
        }
        let text = text.into();

        let mut guard = inner.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            match sink.send(WsFrame::Text(text.clone())).await {
                Ok(()) => {
                    inner.stats.record_sent();
                    return Ok(SendOutcome::Sent);
                }
                Err(e) => warn!("{} send failed, queueing message: {}", inner.config.name, e),
            }
        }
        let evicted = inner.queue.lock().await.push(text);
        drop(guard);

        if evicted > 0 {
            inner
                .stats
                .queue_dropped
                .fetch_add(evicted as u64, Ordering::Relaxed);
            warn!(
                "{} outbound queue full, evicted {} oldest messages",
                inner.config.name, evicted
            );
        }

        inner.maybe_implicit_connect().await;
        Ok(SendOutcome::Queued)
    }

    /// Serialize and [`send`](Self::send) a protocol message.
    pub async fn send_message(&self, message: &DxMessage) -> Result<SendOutcome> {
        self.send(message.to_json()?).await
    }

    /// Send only if the socket is open right now; never queues.
    pub async fn send_now(&self, text: impl Into<String>) -> Result<bool> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(DxStreamError::Destroyed);
        }
        let mut guard = inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Ok(false);
        };
        sink.send(WsFrame::Text(text.into())).await?;
        inner.stats.record_sent();
        Ok(true)
    }

    /// Register a subscription template and send it if the socket is open.
    ///
    /// Returns `true` when the request went out now; otherwise it is sent on
    /// the next open. Re-subscribing the same key replaces the template.
    pub async fn subscribe(
        &self,
        channel: &str,
        request_type: MessageKind,
        symbols: &[String],
        payload: Value,
    ) -> Result<bool> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(DxStreamError::Destroyed);
        }
        if !request_type.is_subscription_request() {
            return Err(DxStreamError::Validation(format!(
                "{} is not a subscription request",
                request_type
            )));
        }

        let key = SubscriptionKey::new(channel, symbols.iter().cloned());
        let mut subscription = Subscription::new(key.clone(), request_type, payload);

        // Sink lock orders this against the resubscribe pass in on_open
        let mut guard = inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            debug!(
                "{} stored subscription {} until next open",
                inner.config.name, key
            );
            inner.subscriptions.insert(key, subscription);
            return Ok(false);
        };

        let request_id = Uuid::new_v4().to_string();
        let text = inner.subscription_text(&subscription, &request_id)?;
        subscription.pending_request_id = Some(request_id);
        inner.subscriptions.insert(key.clone(), subscription);

        match sink.send(WsFrame::Text(text)).await {
            Ok(()) => {
                inner.stats.record_sent();
                debug!("{} subscribed {}", inner.config.name, key);
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "{} subscription {} not sent, will retry on reconnect: {}",
                    inner.config.name, key, e
                );
                Ok(false)
            }
        }
    }

    /// Drop a subscription template. Returns whether it existed.
    pub fn unsubscribe(&self, channel: &str, symbols: &[String]) -> bool {
        let key = SubscriptionKey::new(channel, symbols.iter().cloned());
        let removed = self.inner.subscriptions.remove(&key).is_some();
        if removed {
            debug!("{} unsubscribed {}", self.inner.config.name, key);
        }
        removed
    }

    /// Close the current socket as failed (`code`), triggering a reconnect.
    pub async fn fail(&self, code: u16, reason: &str) {
        let inner = &self.inner;
        if inner.sink.lock().await.is_none() {
            return;
        }
        let epoch = inner.epoch.load(Ordering::SeqCst);
        inner
            .handle_close(epoch, CloseInfo::new(code, reason), true, Origin::Caller)
            .await;
    }

    /// Close with a normal code and cancel all timers. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_close.store(true, Ordering::SeqCst);
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.abort_all();
        }
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        let sink = inner.sink.lock().await.take();
        match sink {
            Some(mut sink) => {
                inner.set_state(ConnectionState::Closing).await;
                if let Err(e) = sink.close(CLOSE_NORMAL, "client disconnect").await {
                    debug!("{} close frame not delivered: {}", inner.config.name, e);
                }
                inner.mark_inactive();
                inner.set_state(ConnectionState::Closed).await;
                info!("{} disconnected", inner.config.name);
                inner.emit(ConnectionEvent::Closed {
                    code: CLOSE_NORMAL,
                    reason: "client disconnect".to_string(),
                });
            }
            None => {
                let state = *inner.state.read().await;
                if !matches!(state, ConnectionState::Idle | ConnectionState::Closed) {
                    inner.set_state(ConnectionState::Closed).await;
                }
            }
        }
    }

    /// Disconnect and drop all subscriptions and queued messages.
    ///
    /// Later `connect`/`send`/`subscribe` calls fail with `Destroyed`.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect().await;
        self.inner.subscriptions.clear();
        self.inner.queue.lock().await.clear();
        info!("{} destroyed", self.inner.config.name);
    }
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    async fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to {
            return;
        }
        *state = to;
        drop(state);
        debug!("{} state {} -> {}", self.config.name, from, to);
        self.emit(ConnectionEvent::StateChanged { from, to });
    }

    fn touch_pong(&self) {
        if let Ok(mut last) = self.last_pong.lock() {
            *last = Instant::now();
        }
    }

    fn last_pong(&self) -> Instant {
        self.last_pong
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    fn reconnect_pending(&self) -> bool {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .reconnect
                    .as_ref()
                    .map(|h| !h.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    fn should_reconnect(&self, code: u16) -> bool {
        self.config.auto_reconnect
            && code != CLOSE_NORMAL
            && !self.destroyed.load(Ordering::SeqCst)
            && !self.manual_close.load(Ordering::SeqCst)
    }

    fn mark_inactive(&self) {
        for mut entry in self.subscriptions.iter_mut() {
            entry.active = false;
        }
    }

    fn subscription_text(&self, subscription: &Subscription, request_id: &str) -> Result<String> {
        let message = DxMessage::subscription_request(
            subscription.request_type,
            request_id,
            self.config.session_str(),
            subscription.payload.clone(),
        )
        .ok_or_else(|| {
            DxStreamError::Validation(format!(
                "{} is not a subscription request",
                subscription.request_type
            ))
        })?;
        Ok(message.to_json()?)
    }

    fn open(self: &Arc<Self>, kind: OpenKind) -> BoxFuture<'static, Result<()>> {
        let inner = Arc::clone(self);
        async move {
            if inner.destroyed.load(Ordering::SeqCst) {
                return Err(DxStreamError::Destroyed);
            }

            {
                let mut state = inner.state.write().await;
                if state.is_active() {
                    return Ok(());
                }
                if kind == OpenKind::Reconnect && inner.manual_close.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if kind != OpenKind::Reconnect {
                    inner.manual_close.store(false, Ordering::SeqCst);
                    // Caller-driven attempt supersedes a pending backoff timer
                    if let Ok(mut tasks) = inner.tasks.lock() {
                        if let Some(handle) = tasks.reconnect.take() {
                            handle.abort();
                        }
                    }
                }
                if kind == OpenKind::Initial {
                    // Explicit connect() starts a fresh reconnect budget
                    inner.reconnect_attempts.store(0, Ordering::SeqCst);
                    if let Ok(mut backoff) = inner.backoff.lock() {
                        backoff.reset();
                    }
                }
                let from = *state;
                *state = ConnectionState::Connecting;
                drop(state);
                inner.emit(ConnectionEvent::StateChanged {
                    from,
                    to: ConnectionState::Connecting,
                });
            }

            info!("Connecting {} to {}", inner.config.name, inner.config.url);
            let result = match inner.handshake().await {
                Ok(connected) => inner.on_open(connected).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => Ok(()),
                Err(DxStreamError::Cancelled) => {
                    debug!("{} closed while connecting", inner.config.name);
                    inner.set_state(ConnectionState::Closed).await;
                    if kind == OpenKind::Initial {
                        Err(DxStreamError::Cancelled)
                    } else {
                        Ok(())
                    }
                }
                Err(e) => {
                    warn!("{} connection attempt failed: {}", inner.config.name, e);
                    inner.set_state(ConnectionState::Error).await;
                    inner.emit(ConnectionEvent::Error(e.to_string()));
                    if inner.should_reconnect(CLOSE_ABNORMAL) {
                        inner.schedule_reconnect(e.retry_after()).await;
                    }
                    if kind == OpenKind::Initial {
                        Err(e)
                    } else {
                        Ok(())
                    }
                }
            }
        }
        .boxed()
    }

    async fn handshake(&self) -> Result<Connected> {
        let connect_timeout = self.config.connect_timeout;
        let attempt = async {
            match tokio::time::timeout(connect_timeout, self.transport.connect(&self.config.url))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DxStreamError::Timeout(format!(
                    "{} handshake timed out after {:?}",
                    self.config.name, connect_timeout
                ))),
            }
        };

        match &self.breaker {
            Some(breaker) => breaker.execute(|| attempt).await,
            None => attempt.await,
        }
    }

    async fn on_open(self: &Arc<Self>, connected: Connected) -> Result<()> {
        let Connected { mut sink, stream } = connected;

        if let Some(text) = self.greeting.as_ref().and_then(|greeting| (**greeting)()) {
            sink.send(WsFrame::Text(text)).await?;
            self.stats.record_sent();
        }

        let mut guard = self.sink.lock().await;
        if self.destroyed.load(Ordering::SeqCst) || self.manual_close.load(Ordering::SeqCst) {
            drop(guard);
            if let Err(e) = sink.close(CLOSE_NORMAL, "client disconnect").await {
                debug!("{} close frame not delivered: {}", self.config.name, e);
            }
            return Err(DxStreamError::Cancelled);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *guard = Some(sink);
        self.set_state(ConnectionState::Open).await;
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.reset();
        }
        self.touch_pong();
        let reconnected = self.has_opened.swap(true, Ordering::SeqCst);

        if let Some(sink) = guard.as_mut() {
            self.drain_queue(sink.as_mut()).await;
            self.resubscribe(sink.as_mut()).await;
        }
        drop(guard);

        info!(
            "{} connected to {}{}",
            self.config.name,
            self.config.url,
            if reconnected { " (reconnected)" } else { "" }
        );
        self.emit(ConnectionEvent::Opened { reconnected });

        let reader = self.spawn_reader(epoch, stream);
        let heartbeat = self
            .config
            .heartbeat_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| self.spawn_heartbeat(epoch, interval));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.install(reader, heartbeat);
        }
        Ok(())
    }

    async fn drain_queue(&self, sink: &mut dyn FrameSink) {
        let mut queue = self.queue.lock().await;
        let mut drained = 0usize;
        while let Some(message) = queue.pop_front() {
            match sink.send(WsFrame::Text(message.text.clone())).await {
                Ok(()) => {
                    drained += 1;
                    self.stats.record_sent();
                }
                Err(e) => {
                    warn!(
                        "{} queue drain aborted after {} messages: {}",
                        self.config.name, drained, e
                    );
                    queue.requeue_front(message);
                    break;
                }
            }
        }
        if drained > 0 {
            debug!("{} drained {} queued messages", self.config.name, drained);
        }
    }

    async fn resubscribe(&self, sink: &mut dyn FrameSink) {
        let mut requests = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let request_id = Uuid::new_v4().to_string();
            match self.subscription_text(entry.value(), &request_id) {
                Ok(text) => {
                    entry.active = false;
                    entry.pending_request_id = Some(request_id);
                    requests.push((entry.key.clone(), text));
                }
                Err(e) => warn!("{} cannot rebuild {}: {}", self.config.name, entry.key, e),
            }
        }
        requests.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, text) in requests {
            if let Err(e) = sink.send(WsFrame::Text(text)).await {
                warn!("{} resubscribe of {} failed: {}", self.config.name, key, e);
                break;
            }
            self.stats.record_sent();
            debug!("{} resubscribed {}", self.config.name, key);
        }
    }

    fn spawn_reader(self: &Arc<Self>, epoch: u64, mut stream: FrameStream) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let (close, failed) = loop {
                match stream.next().await {
                    Some(Ok(WsFrame::Text(text))) => inner.handle_text(&text),
                    Some(Ok(WsFrame::Pong(_))) => inner.touch_pong(),
                    // Transports answer protocol-level pings themselves
                    Some(Ok(WsFrame::Ping(_))) => {}
                    Some(Ok(WsFrame::Close(info))) => {
                        break (
                            info.unwrap_or_else(|| CloseInfo::new(CLOSE_NO_STATUS, "")),
                            false,
                        )
                    }
                    Some(Err(e)) => break (CloseInfo::new(CLOSE_ABNORMAL, e.to_string()), true),
                    None => break (CloseInfo::new(CLOSE_ABNORMAL, "connection dropped"), false),
                }
            };
            inner.handle_close(epoch, close, failed, Origin::Reader).await;
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>, epoch: u64, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let pong_timeout = inner.config.pong_timeout;
            loop {
                tokio::time::sleep(interval).await;

                let sent_at = Instant::now();
                let sent = match inner.sink.lock().await.as_mut() {
                    Some(sink) => sink.send(WsFrame::Ping(Vec::new())).await.is_ok(),
                    None => false,
                };
                if !sent {
                    debug!("{} heartbeat stopped, socket gone", inner.config.name);
                    return;
                }

                tokio::time::sleep(pong_timeout).await;
                if inner.last_pong() < sent_at {
                    warn!(
                        "{} no pong within {:?}, closing connection",
                        inner.config.name, pong_timeout
                    );
                    inner
                        .handle_close(
                            epoch,
                            CloseInfo::new(CLOSE_PONG_TIMEOUT, "pong timeout"),
                            true,
                            Origin::Heartbeat,
                        )
                        .await;
                    return;
                }
            }
        })
    }

    fn handle_text(&self, text: &str) {
        self.stats.record_received();
        debug!(
            "{} <- {}",
            self.config.name,
            truncate_payload(text, RAW_PREVIEW_LEN)
        );
        self.emit(ConnectionEvent::Raw(text.to_string()));

        match parse_inbound(text) {
            Ok(parsed) => {
                match (route(&parsed.message), &parsed.message) {
                    (Route::Heartbeat, _) => self.touch_pong(),
                    (Route::SubscriptionAck, DxMessage::SubscriptionResponse(response)) => self
                        .acknowledge(
                            &response.request_id,
                            response.success,
                            response.error.as_deref(),
                        ),
                    (Route::Data(kind), _) => {
                        let now = Utc::now();
                        for mut entry in self.subscriptions.iter_mut() {
                            if entry.active && entry.feeds(kind) {
                                entry.last_update = Some(now);
                            }
                        }
                    }
                    (Route::Outbound, message) => debug!(
                        "{} server echoed outbound {}",
                        self.config.name,
                        message.kind()
                    ),
                    _ => {}
                }
                self.emit(ConnectionEvent::Message(Arc::new(parsed)));
            }
            Err(e) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                let raw_preview = truncate_payload(text, RAW_PREVIEW_LEN);
                warn!(
                    "{} dropped unparseable message: {} ({})",
                    self.config.name, e, raw_preview
                );
                self.emit(ConnectionEvent::ProtocolError {
                    error: e.to_string(),
                    raw_preview,
                });
            }
        }
    }

    fn acknowledge(&self, request_id: &str, success: bool, error: Option<&str>) {
        let mut matched = false;
        for mut entry in self.subscriptions.iter_mut() {
            if entry.pending_request_id.as_deref() != Some(request_id) {
                continue;
            }
            matched = true;
            entry.pending_request_id = None;
            if success {
                entry.active = true;
                entry.last_update = Some(Utc::now());
                debug!("{} subscription {} active", self.config.name, entry.key);
            } else {
                warn!(
                    "{} subscription {} rejected: {}",
                    self.config.name,
                    entry.key,
                    error.unwrap_or("no reason given")
                );
            }
        }
        if !matched {
            debug!(
                "{} acknowledgement for unknown request {}",
                self.config.name, request_id
            );
        }
    }

    async fn handle_close(
        self: &Arc<Self>,
        epoch: u64,
        close: CloseInfo,
        failed: bool,
        origin: Origin,
    ) {
        if self
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("{} ignoring stale close ({})", self.config.name, close.code);
            return;
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_io(origin);
        }

        let sink = self.sink.lock().await.take();
        // The reader only closes after the peer is already gone
        if let Some(mut sink) = sink {
            if origin != Origin::Reader {
                if let Err(e) = sink.close(close.code, &close.reason).await {
                    debug!("{} close frame not delivered: {}", self.config.name, e);
                }
            }
        }

        self.mark_inactive();
        if failed {
            warn!(
                "{} connection failed ({}): {}",
                self.config.name, close.code, close.reason
            );
            self.set_state(ConnectionState::Error).await;
        } else {
            info!(
                "{} connection closed ({}): {}",
                self.config.name, close.code, close.reason
            );
            self.set_state(ConnectionState::Closed).await;
        }
        self.emit(ConnectionEvent::Closed {
            code: close.code,
            reason: close.reason.clone(),
        });

        if self.should_reconnect(close.code) {
            self.schedule_reconnect(None).await;
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>, retry_after: Option<Duration>) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = if attempt >= self.config.max_reconnect_attempts {
            None
        } else {
            self.backoff
                .lock()
                .ok()
                .and_then(|mut backoff| backoff.next_delay(attempt))
        };

        let Some(delay) = delay else {
            self.reconnect_attempts.store(attempt, Ordering::SeqCst);
            error!(
                "{}",
                DxStreamError::ReconnectExhausted {
                    connection: self.config.name.clone(),
                    attempts: attempt,
                }
            );
            self.set_state(ConnectionState::Error).await;
            self.emit(ConnectionEvent::ReconnectExhausted { attempts: attempt });
            return;
        };

        let delay = retry_after.map_or(delay, |hint| delay.max(hint));
        let attempts = attempt + 1;
        info!(
            "{} reconnecting in {:?} (attempt {}/{})",
            self.config.name, delay, attempts, self.config.max_reconnect_attempts
        );
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        self.emit(ConnectionEvent::Reconnecting {
            attempt: attempts,
            delay,
        });

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.destroyed.load(Ordering::SeqCst) || inner.manual_close.load(Ordering::SeqCst) {
                debug!("{} reconnect cancelled", inner.config.name);
                return;
            }
            if let Err(e) = inner.open(OpenKind::Reconnect).await {
                debug!("{} reconnect attempt ended: {}", inner.config.name, e);
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.reconnect = Some(handle);
        }
    }

    async fn maybe_implicit_connect(self: &Arc<Self>) {
        let state = *self.state.read().await;
        if !matches!(state, ConnectionState::Idle | ConnectionState::Closed)
            || self.reconnect_pending()
        {
            return;
        }
        if self.implicit_connect.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.open(OpenKind::Implicit).await {
                debug!("{} implicit connect failed: {}", inner.config.name, e);
            }
            inner.implicit_connect.store(false, Ordering::SeqCst);
        });
    }
}
