//! Common test utilities for relink-client integration tests
//!
//! Provides a mock WebSocket server that can refuse handshakes, answer
//! frames, push frames and close the live connection with a chosen code.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use relink_client::{Peer, PeerEvent, PeerEventKind, Transport, TransportEvent, TransportEventKind};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Default wait for anything the tests expect to happen
pub const WAIT: Duration = Duration::from_secs(5);

/// Frame pushed by the server to the live connection
pub enum Outbound {
    Text(String),
    Close(u16),
}

type Handler = Arc<dyn Fn(String) -> Option<String> + Send + Sync>;

/// Mock WebSocket server for client testing
pub struct MockWsServer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    task: JoinHandle<()>,
}

impl MockWsServer {
    /// Start a server that never replies
    pub async fn new() -> Self {
        Self::start(0, |_| None).await
    }

    /// Start a server replying through `handler`
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(String) -> Option<String> + Send + Sync + 'static,
    {
        Self::start(0, handler).await
    }

    /// Start a server that drops the first `refuse` TCP connections before
    /// the WebSocket handshake
    pub async fn start<F>(refuse: usize, handler: F) -> Self
    where
        F: Fn(String) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handler: Handler = Arc::new(handler);
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let current: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>> =
            Arc::new(Mutex::new(None));

        let task = {
            let connections = connections.clone();
            let current = current.clone();
            tokio::spawn(async move {
                let mut refused = 0;
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };

                    if refused < refuse {
                        refused += 1;
                        drop(stream);
                        continue;
                    }

                    let Ok(ws_stream) = accept_async(stream).await else {
                        continue;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    *current.lock().unwrap() = Some(outbound_tx);

                    tokio::spawn(serve_connection(
                        ws_stream,
                        outbound_rx,
                        handler.clone(),
                        received_tx.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            connections,
            current,
            task,
        }
    }

    /// Get the WebSocket URL for connecting to this server
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of completed WebSocket handshakes
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` handshakes completed
    pub async fn wait_for_connections(&self, count: usize) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.connections() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Push a frame to the most recent connection
    pub fn push(&self, outbound: Outbound) {
        if let Some(tx) = self.current.lock().unwrap().as_ref() {
            let _ = tx.send(outbound);
        }
    }

    /// Push a text frame
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Outbound::Text(text.into()));
    }

    /// Close the most recent connection with `code`
    pub fn close_with(&self, code: u16) {
        self.push(Outbound::Close(code));
    }

    /// Wait for a text frame received by the server
    pub async fn wait_for_message(&mut self) -> Option<String> {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for a received frame and decode it as JSON
    pub async fn wait_for_json(&mut self) -> Value {
        let text = self.wait_for_message().await.expect("no frame received");
        serde_json::from_str(&text).unwrap()
    }

    /// Shutdown the mock server
    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn serve_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handler: Handler,
    received: mpsc::UnboundedSender<String>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = received.send(text.clone());
                        if let Some(reply) = handler(text) {
                            let _ = write.send(Message::Text(reply)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(text)) => {
                        let _ = write.send(Message::Text(text)).await;
                    }
                    Some(Outbound::Close(code)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        let _ = write.close().await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Record every lifecycle event of a transport into a channel
pub fn transport_events(transport: &Transport) -> mpsc::UnboundedReceiver<TransportEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        TransportEventKind::Open,
        TransportEventKind::Failed,
        TransportEventKind::Disconnected,
        TransportEventKind::Close,
        TransportEventKind::Message,
    ] {
        let tx = tx.clone();
        transport
            .on(kind, move |event| {
                let _ = tx.send(event.clone());
            })
            .unwrap();
    }
    rx
}

/// Record every event of a peer into a channel
pub fn peer_events(peer: &Peer) -> mpsc::UnboundedReceiver<PeerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        PeerEventKind::Open,
        PeerEventKind::Failed,
        PeerEventKind::Disconnected,
        PeerEventKind::Close,
        PeerEventKind::Notification,
    ] {
        let tx = tx.clone();
        peer.on(kind, move |event| {
            let _ = tx.send(event.clone());
        })
        .unwrap();
    }
    rx
}

/// Receive the next event or panic after [`WAIT`]
pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert that no event arrives within `window`
pub async fn assert_no_event<T: std::fmt::Debug>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    window: Duration,
) {
    if let Ok(Some(event)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Build a success response for the request in `raw`
pub fn success_for(raw: &str, data: Value) -> Option<String> {
    let request: Value = serde_json::from_str(raw).ok()?;
    if request.get("request").is_none() {
        return None;
    }
    Some(
        serde_json::json!({
            "response": true,
            "id": request["id"],
            "ok": true,
            "data": data,
        })
        .to_string(),
    )
}

/// Build an error response for the request in `raw`
pub fn error_for(raw: &str, code: i32, reason: &str) -> Option<String> {
    let request: Value = serde_json::from_str(raw).ok()?;
    if request.get("request").is_none() {
        return None;
    }
    Some(
        serde_json::json!({
            "response": true,
            "id": request["id"],
            "ok": false,
            "errorCode": code,
            "errorReason": reason,
        })
        .to_string(),
    )
}
