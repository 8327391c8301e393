use dxstream::adapters::{channel_transport, ChannelServer, ServerSession};
use dxstream::config::DualStreamConfig;
use dxstream::dxtrade::{
    DualStreamClient, DualStreamEvent, SessionCredentials, StreamErrorKind, StreamKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn config() -> DualStreamConfig {
    DualStreamConfig {
        market_data_url: "ws://broker.test/md".to_string(),
        portfolio_url: "ws://broker.test/pf".to_string(),
        heartbeat_interval_ms: 0,
        reconnect_delay_ms: 5,
        max_reconnect_delay_ms: 20,
        max_reconnect_attempts: 3,
        jitter: false,
        ..Default::default()
    }
}

fn client(config: DualStreamConfig) -> (DualStreamClient, ChannelServer) {
    let (transport, server) = channel_transport();
    let client = DualStreamClient::with_transport(
        config,
        SessionCredentials::new("session-token", "ACC-7"),
        Arc::new(transport),
    )
    .expect("valid client");
    (client, server)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<DualStreamEvent>, mut pred: F) -> DualStreamEvent
where
    F: FnMut(&DualStreamEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Accept both sockets and split them by URL, consuming each greeting.
async fn accept_pair(server: &ChannelServer) -> (ServerSession, ServerSession) {
    let mut md = None;
    let mut pf = None;
    for _ in 0..2 {
        let mut session = server.accept_timeout(WAIT).await.expect("socket");
        let greeting = session.recv_json_timeout(WAIT).await.expect("greeting");
        assert_eq!(greeting["type"], "Ping");
        assert_eq!(greeting["session"], "session-token");
        if session.url.ends_with("/md") {
            md = Some(session);
        } else {
            pf = Some(session);
        }
    }
    (md.expect("market data socket"), pf.expect("portfolio socket"))
}

#[tokio::test]
async fn both_streams_ready_after_acknowledgements() {
    let (client, server) = client(config());
    let mut events = client.subscribe();

    client.subscribe_to_market_data(&[]).await.unwrap();
    client.subscribe_to_portfolio_data().await.unwrap();
    assert!(client.connect().await);
    assert!(!client.is_ready().await);

    let (mut md, mut pf) = accept_pair(&server).await;

    let portfolio_request = pf.recv_json_timeout(WAIT).await.unwrap();
    assert_eq!(portfolio_request["type"], "AccountPortfoliosSubscriptionRequest");
    assert_eq!(portfolio_request["payload"]["accounts"], json!(["ALL"]));
    assert_eq!(portfolio_request["payload"]["withOffset"], true);
    pf.send_json(&json!({
        "type": "SubscriptionResponse",
        "requestId": portfolio_request["requestId"],
        "success": true,
    }));

    // Portfolio alone does not make the client ready
    wait_for(&mut events, |e| {
        matches!(e, DualStreamEvent::SubscriptionResponse { stream: StreamKind::Portfolio, .. })
    })
    .await;
    assert!(!client.is_ready().await);

    for _ in 0..2 {
        let request = md.recv_json_timeout(WAIT).await.unwrap();
        md.send_json(&json!({
            "type": "SubscriptionResponse",
            "requestId": request["requestId"],
            "success": true,
        }));
    }
    wait_for(&mut events, |e| matches!(e, DualStreamEvent::ReadyChanged { ready: true })).await;

    let status = client.get_status().await;
    assert!(status.market_data.subscribed && status.portfolio.subscribed);
    assert!(status.market_data.authenticated && status.portfolio.authenticated);

    client.destroy().await;
}

#[tokio::test]
async fn portfolio_drop_leaves_market_data_untouched() {
    let (client, server) = client(config());
    let mut events = client.subscribe();
    assert!(client.connect().await);

    let (mut md, mut pf) = accept_pair(&server).await;
    pf.drop_connection();

    let dropped = wait_for(&mut events, |e| matches!(e, DualStreamEvent::Disconnected { .. })).await;
    assert!(matches!(
        dropped,
        DualStreamEvent::Disconnected { stream: StreamKind::Portfolio, .. }
    ));
    assert!(client.get_status().await.market_data.connected);

    let mut pf2 = server.accept_timeout(WAIT).await.expect("portfolio reconnect");
    assert!(pf2.url.ends_with("/pf"));
    pf2.recv_json_timeout(WAIT).await.expect("greeting on new socket");
    wait_for(&mut events, |e| {
        matches!(e, DualStreamEvent::Reconnected { stream: StreamKind::Portfolio })
    })
    .await;

    // Market data saw no reconnect and no second greeting
    assert!(md.drain_text().is_empty());
    let status = client.get_status().await;
    assert_eq!(status.market_data.reconnect_attempts, 0);
    assert!(status.portfolio.connected);

    client.destroy().await;
}

#[tokio::test]
async fn keepalive_requests_are_answered_per_socket() {
    let (client, server) = client(config());
    let mut events = client.subscribe();
    assert!(client.connect().await);
    let (mut md, mut pf) = accept_pair(&server).await;

    md.send_json(&json!({"type": "PingRequest", "timestamp": 1_700_000_000_000_i64}));
    md.send_json(&json!({"type": "PingRequest", "timestamp": 1_700_000_000_001_i64}));
    pf.send_json(&json!({"type": "PingRequest", "timestamp": 1_700_000_000_002_i64}));

    let echo = md.recv_json_timeout(WAIT).await.unwrap();
    assert_eq!(echo["timestamp"], 1_700_000_000_000_i64);
    let echo = md.recv_json_timeout(WAIT).await.unwrap();
    assert_eq!(echo["timestamp"], 1_700_000_000_001_i64);
    let echo = pf.recv_json_timeout(WAIT).await.unwrap();
    assert_eq!(echo["type"], "Ping");
    assert_eq!(echo["session"], "session-token");
    assert_eq!(echo["timestamp"], 1_700_000_000_002_i64);

    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, DualStreamEvent::PingRequest { .. })).await;
    }
    let stats = client.get_status().await.ping_stats;
    assert_eq!((stats.requests_received, stats.responses_sent), (3, 3));
    assert!(client.is_stable().await);

    client.destroy().await;
}

#[tokio::test]
async fn exhausted_side_blocks_readiness_until_connect() {
    let config = DualStreamConfig {
        enable_portfolio: false,
        max_reconnect_attempts: 2,
        ..config()
    };
    let (client, server) = client(config);
    let mut events = client.subscribe();
    server.refuse_all(true);

    assert!(!client.connect().await);
    let exhausted = wait_for(&mut events, |e| {
        matches!(e, DualStreamEvent::Error { kind: StreamErrorKind::ReconnectExhausted, .. })
    })
    .await;
    assert!(matches!(
        exhausted,
        DualStreamEvent::Error { stream: StreamKind::MarketData, .. }
    ));
    // Initial attempt plus two retries
    assert_eq!(server.connect_attempts(), 3);
    let status = client.get_status().await;
    assert!(status.market_data.exhausted);
    assert!(!status.is_ready);

    // A caller connect() while the server is still down gets a full budget again
    assert!(!client.connect().await);
    let mut retries = 0;
    loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                DualStreamEvent::Reconnecting { .. }
                    | DualStreamEvent::Error { kind: StreamErrorKind::ReconnectExhausted, .. }
            )
        })
        .await
        {
            DualStreamEvent::Reconnecting { attempt, .. } => {
                retries += 1;
                assert_eq!(attempt, retries);
            }
            _ => break,
        }
    }
    assert_eq!(retries, 2);
    assert_eq!(server.connect_attempts(), 6);
    assert!(client.get_status().await.market_data.exhausted);

    server.refuse_all(false);
    assert!(client.connect().await);
    let _session = server.accept_timeout(WAIT).await.expect("accepted");
    let status = client.get_status().await;
    assert!(!status.market_data.exhausted);
    assert!(status.market_data.connected);

    client.destroy().await;
}

#[tokio::test]
async fn unsubscribe_sends_empty_replacement() {
    let (client, server) = client(DualStreamConfig {
        enable_portfolio: false,
        ..config()
    });
    client
        .subscribe_to_market_data(&["USD/JPY".to_string()])
        .await
        .unwrap();
    assert!(client.connect().await);

    let mut md = server.accept_timeout(WAIT).await.unwrap();
    md.recv_json_timeout(WAIT).await.unwrap();
    for _ in 0..2 {
        md.recv_json_timeout(WAIT).await.unwrap();
    }

    assert!(client
        .unsubscribe_from_market_data(&["USD/JPY".to_string()])
        .await
        .unwrap());
    for _ in 0..2 {
        let request = md.recv_json_timeout(WAIT).await.unwrap();
        assert_eq!(request["payload"]["symbols"], json!([]));
    }
    let conn = client.connection(StreamKind::MarketData).unwrap();
    assert!(conn.subscriptions().is_empty());
    assert!(!client
        .unsubscribe_from_market_data(&["USD/JPY".to_string()])
        .await
        .unwrap());

    client.destroy().await;
}

#[tokio::test]
async fn market_data_only_readiness_follows_its_socket() {
    let (client, server) = client(DualStreamConfig {
        enable_portfolio: false,
        ..config()
    });
    let mut events = client.subscribe();
    client.subscribe_to_market_data(&[]).await.unwrap();
    assert!(client.connect().await);

    let mut md = server.accept_timeout(WAIT).await.unwrap();
    md.recv_json_timeout(WAIT).await.unwrap();
    for _ in 0..2 {
        let request = md.recv_json_timeout(WAIT).await.unwrap();
        md.send_json(&json!({
            "type": "SubscriptionResponse",
            "requestId": request["requestId"],
            "success": true,
        }));
    }
    wait_for(&mut events, |e| matches!(e, DualStreamEvent::ReadyChanged { ready: true })).await;

    md.drop_connection();
    wait_for(&mut events, |e| matches!(e, DualStreamEvent::ReadyChanged { ready: false })).await;
    let status = client.get_status().await;
    assert!(!status.portfolio.enabled && !status.portfolio.connected);
    assert!(client.connection(StreamKind::Portfolio).is_none());

    // Only the market data socket comes back
    let mut md2 = server.accept_timeout(WAIT).await.expect("market data reconnect");
    assert!(md2.url.ends_with("/md"));
    md2.recv_json_timeout(WAIT).await.unwrap();
    for _ in 0..2 {
        let request = md2.recv_json_timeout(WAIT).await.unwrap();
        md2.send_json(&json!({
            "type": "SubscriptionResponse",
            "requestId": request["requestId"],
            "success": true,
        }));
    }
    wait_for(&mut events, |e| matches!(e, DualStreamEvent::ReadyChanged { ready: true })).await;
    assert_eq!(server.connect_attempts(), 2);

    client.destroy().await;
}
