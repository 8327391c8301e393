use dxstream::adapters::{channel_transport, ServerSession};
use dxstream::connection::{Connection, ConnectionConfig, ConnectionEvent, ConnectionState};
use dxstream::coordination::BackoffConfig;
use dxstream::protocol::{DxMessage, MessageKind};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn config(name: &str) -> ConnectionConfig {
    ConnectionConfig {
        heartbeat_interval: None,
        max_reconnect_attempts: 5,
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: 5,
            jitter: false,
            ..Default::default()
        },
        ..ConnectionConfig::new(name, format!("ws://broker.test/{}", name))
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ConnectionEvent>, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
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

fn is_ack(event: &ConnectionEvent) -> bool {
    matches!(
        event,
        ConnectionEvent::Message(parsed)
            if matches!(parsed.message, DxMessage::SubscriptionResponse(_))
    )
}

fn ack(session: &ServerSession, request: &Value) {
    session.send_json(&json!({
        "type": "SubscriptionResponse",
        "requestId": request["requestId"],
        "success": true,
    }));
}

#[tokio::test]
async fn reconnect_resubscribes_exactly_once() {
    let (transport, server) = channel_transport();
    let conn = Connection::new(config("md"), Arc::new(transport), None);
    let mut events = conn.subscribe_events();

    let symbols = vec!["EUR/USD".to_string()];
    let sent = conn
        .subscribe(
            "quotes",
            MessageKind::MarketDataSubscriptionRequest,
            &symbols,
            json!({"symbols": symbols}),
        )
        .await
        .unwrap();
    assert!(!sent);
    conn.connect().await.unwrap();

    let mut first = server.accept_timeout(WAIT).await.expect("first socket");
    let request = first.recv_json_timeout(WAIT).await.expect("subscription");
    assert_eq!(request["type"], "MarketDataSubscriptionRequest");
    assert!(!conn.all_subscriptions_active());

    ack(&first, &request);
    wait_for(&mut events, is_ack).await;
    assert!(conn.all_subscriptions_active());

    first.drop_connection();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened { reconnected: true })).await;

    let mut second = server.accept_timeout(WAIT).await.expect("second socket");
    let resent = second.recv_json_timeout(WAIT).await.expect("resubscription");
    assert_eq!(resent["payload"], request["payload"]);
    assert_ne!(resent["requestId"], request["requestId"]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(second.drain_text().is_empty(), "subscription sent twice");
    assert!(!conn.all_subscriptions_active());

    ack(&second, &resent);
    wait_for(&mut events, is_ack).await;
    assert!(conn.all_subscriptions_active());
    assert_eq!(conn.stats().reconnects, 1);

    conn.destroy().await;
}

#[tokio::test]
async fn stale_ack_does_not_activate_resubscription() {
    let (transport, server) = channel_transport();
    let conn = Connection::new(config("md"), Arc::new(transport), None);
    let mut events = conn.subscribe_events();

    conn.subscribe(
        "quotes",
        MessageKind::MarketDataSubscriptionRequest,
        &["EUR/USD".to_string()],
        json!({}),
    )
    .await
    .unwrap();
    conn.connect().await.unwrap();

    let mut first = server.accept_timeout(WAIT).await.unwrap();
    let old = first.recv_json_timeout(WAIT).await.unwrap();
    first.drop_connection();

    let mut second = server.accept_timeout(WAIT).await.unwrap();
    second.recv_json_timeout(WAIT).await.unwrap();
    ack(&second, &old);
    wait_for(&mut events, is_ack).await;
    assert!(!conn.all_subscriptions_active());

    conn.destroy().await;
}

#[tokio::test]
async fn queue_overflow_evicts_oldest_batch() {
    let (transport, server) = channel_transport();
    server.refuse_all(true);
    let conn = Connection::new(
        ConnectionConfig {
            auto_reconnect: false,
            max_queue_size: 100,
            ..config("md")
        },
        Arc::new(transport),
        None,
    );

    for i in 0..150 {
        conn.send(format!("msg-{}", i)).await.unwrap();
    }

    assert_eq!(conn.queue_len().await, 100);
    assert_eq!(conn.stats().queue_dropped, 50);
    let queued = conn.queued_messages().await;
    assert_eq!(queued.first().map(String::as_str), Some("msg-50"));
    assert_eq!(queued.last().map(String::as_str), Some("msg-149"));

    conn.destroy().await;
}

#[tokio::test]
async fn queued_messages_flush_once_server_accepts() {
    let (transport, server) = channel_transport();
    server.refuse_all(true);
    let conn = Connection::new(config("md"), Arc::new(transport), None);
    let mut events = conn.subscribe_events();

    for i in 0..3 {
        conn.send(format!("order-{}", i)).await.unwrap();
    }
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Reconnecting { .. })).await;
    server.refuse_all(false);

    let mut session = server.accept_timeout(WAIT).await.expect("accepted after refusal");
    for i in 0..3 {
        assert_eq!(session.recv_text().await.unwrap(), format!("order-{}", i));
    }
    assert_eq!(conn.queue_len().await, 0);
    assert_eq!(conn.state().await, ConnectionState::Open);

    conn.destroy().await;
}
