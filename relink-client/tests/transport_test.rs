//! Integration tests for the reconnecting transport
//!
//! Each test runs a mock WebSocket server and observes the transport's
//! events: opening, failed attempts, disconnection, terminal closure and
//! message forwarding.

mod common;

use common::{assert_no_event, next_event, transport_events, MockWsServer};
use relink_client::{ConnectionState, RetryOptions, Transport, TransportEvent, TransportOptions};
use relink_core::{Error, Message};
use std::time::Duration;

fn fast_options() -> TransportOptions {
    TransportOptions::default().with_backoff(vec![Duration::from_millis(20); 5])
}

#[tokio::test]
async fn test_open_then_server_close_4000_is_terminal() {
    let server = MockWsServer::new().await;
    let transport = Transport::new(server.url(), fast_options()).unwrap();
    let mut events = transport_events(&transport);

    transport.connect();
    assert_eq!(next_event(&mut events).await, TransportEvent::Open);
    assert!(transport.is_connected());

    server.close_with(4000);
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Close {
            code: Some(4000),
            cause: None
        }
    );

    assert!(transport.is_closed());
    assert_eq!(transport.state(), ConnectionState::Closed);

    // No reconnection follows
    assert_no_event(&mut events, Duration::from_millis(200)).await;
    assert_eq!(server.connections(), 1);
    server.shutdown();
}

#[tokio::test]
async fn test_refused_attempts_then_open() {
    let server = MockWsServer::start(3, |_| None).await;
    let transport = Transport::new(server.url(), fast_options()).unwrap();
    let mut events = transport_events(&transport);

    transport.connect();

    for attempt in 1..=3 {
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Failed { attempt }
        );
    }
    assert_eq!(next_event(&mut events).await, TransportEvent::Open);
    assert!(server.wait_for_connections(1).await);
    assert_eq!(server.connections(), 1);

    transport.close().await;
    server.shutdown();
}

#[tokio::test]
async fn test_disconnect_then_reconnect() {
    let server = MockWsServer::new().await;
    let transport = Transport::new(server.url(), fast_options()).unwrap();
    let mut events = transport_events(&transport);

    transport.connect();
    assert_eq!(next_event(&mut events).await, TransportEvent::Open);

    server.close_with(1001);
    assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
    assert!(!transport.is_connected());

    assert_eq!(next_event(&mut events).await, TransportEvent::Open);
    assert!(server.wait_for_connections(2).await);
    assert_eq!(transport.state(), ConnectionState::Open);

    transport.close().await;
    server.shutdown();
}

#[tokio::test]
async fn test_messages_are_parsed_and_malformed_frames_dropped() {
    let server = MockWsServer::new().await;
    let transport = Transport::new(server.url(), fast_options()).unwrap();
    let mut events = transport_events(&transport);

    transport.connect();
    assert_eq!(next_event(&mut events).await, TransportEvent::Open);

    server.push_text("{not json");
    server.push_text(r#"{"method":"orphan"}"#);
    server.push_text(r#"{"notification":true,"method":"tick","data":{"n":1}}"#);

    match next_event(&mut events).await {
        TransportEvent::Message(message) => {
            assert_eq!(
                message,
                Message::notification("tick", Some(serde_json::json!({"n": 1})))
            );
        }
        other => panic!("Expected message, got {:?}", other),
    }

    transport.close().await;
    server.shutdown();
}

#[tokio::test]
async fn test_send_reaches_server() {
    let mut server = MockWsServer::new().await;
    let transport = Transport::new(server.url(), fast_options()).unwrap();

    transport.connect();
    transport
        .wait_until_open(common::WAIT)
        .await
        .unwrap();

    let message = Message::notification("hello", Some(serde_json::json!({"name": "alice"})));
    transport.send_message(&message).await.unwrap();
    transport.try_send(r#"{"notification":true,"method":"bye","data":{}}"#).unwrap();

    let first = server.wait_for_json().await;
    assert_eq!(first["notification"], true);
    assert_eq!(first["method"], "hello");
    assert_eq!(first["data"]["name"], "alice");

    let second = server.wait_for_json().await;
    assert_eq!(second["method"], "bye");

    transport.close().await;
    server.shutdown();
}

#[tokio::test]
async fn test_close_emits_once_and_blocks_further_events() {
    let server = MockWsServer::new().await;
    let transport = Transport::new(server.url(), fast_options()).unwrap();
    let mut events = transport_events(&transport);

    transport.connect();
    assert_eq!(next_event(&mut events).await, TransportEvent::Open);

    transport.close().await;
    transport.close().await;

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Close {
            code: None,
            cause: None
        }
    );
    assert_no_event(&mut events, Duration::from_millis(200)).await;

    assert_eq!(transport.send("{}").await, Err(Error::TransportClosed));
    assert_eq!(server.connections(), 1);
    server.shutdown();
}

#[tokio::test]
async fn test_connect_timeout_counts_as_failed_attempt() {
    // A listener that accepts TCP but never completes the handshake
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let _hold = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            streams.push(stream);
        }
    });

    let options = TransportOptions::default()
        .with_backoff(vec![Duration::from_millis(10)])
        .with_connect_timeout(Duration::from_millis(100));
    let transport = Transport::new(url, options).unwrap();
    let mut events = transport_events(&transport);

    transport.connect();
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Failed { attempt: 1 }
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Failed { attempt: 2 }
    );

    match next_event(&mut events).await {
        TransportEvent::Close { code, cause } => {
            assert_eq!(code, Some(relink_client::ABNORMAL_CLOSURE_CODE));
            assert_eq!(
                cause,
                Some(Error::WebSocket("connect attempt timed out".to_string()))
            );
        }
        other => panic!("Expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_max_retry_time_ends_connect_cycle() {
    // Nothing listens on a port that was bound and released
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let options = TransportOptions::default()
        .with_backoff(vec![Duration::from_millis(100); 20])
        .with_retry(RetryOptions::default().with_max_retry_time(Duration::from_millis(250)));
    let transport = Transport::new(url, options).unwrap();
    let mut events = transport_events(&transport);

    let started = std::time::Instant::now();
    transport.connect();

    let mut failed = 0;
    let (code, cause) = loop {
        match next_event(&mut events).await {
            TransportEvent::Failed { attempt } => {
                failed += 1;
                assert_eq!(attempt, failed);
            }
            TransportEvent::Close { code, cause } => break (code, cause),
            other => panic!("Unexpected event {:?}", other),
        }
    };

    // Gave up on time, long before the 20-step schedule ran out
    assert!((3..=5).contains(&failed), "failed attempts: {}", failed);
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(code, Some(relink_client::ABNORMAL_CLOSURE_CODE));
    // The repeated refusal outweighs the single retry-time entry
    assert!(matches!(cause, Some(Error::WebSocket(_))));

    assert!(transport.is_closed());
    assert_no_event(&mut events, Duration::from_millis(300)).await;
}
