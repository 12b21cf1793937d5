//! Room client demo
//!
//! Connects to a relink-compatible server, joins a room, answers pings and
//! prints notifications until Ctrl+C.
//!
//! ```text
//! cargo run --example room_client -- ws://localhost:4443/?peerId=alice
//! ```

use relink::client::BackoffConfig;
use relink::{PeerBuilder, PeerEvent, PeerEventKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Serialize)]
struct JoinRequest {
    room: String,
    display_name: String,
}

#[derive(Deserialize, Debug)]
struct JoinResponse {
    #[serde(default)]
    peers: Vec<Value>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("relink=debug,room_client=info")
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:4443/?peerId=demo".to_string());

    let peer = PeerBuilder::new(url)
        .backoff(
            BackoffConfig::default()
                .unbounded()
                .with_min_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(8))
                .with_randomize(true),
        )
        .request_timeout(Duration::from_secs(10))
        .wait_for_connection(true)
        .build()?;

    peer.on(PeerEventKind::Open, |_| tracing::info!("connected"))?;
    peer.on(PeerEventKind::Disconnected, |_| tracing::warn!("disconnected"))?;
    peer.on(PeerEventKind::Failed, |event| {
        if let PeerEvent::Failed { attempt } = event {
            tracing::warn!(attempt, "connect attempt failed");
        }
    })?;
    peer.on(PeerEventKind::Request, |event| {
        if let PeerEvent::Request(request) = event {
            let result = match request.method() {
                "ping" => request.accept(serde_json::json!({"pong": true})),
                other => request.reject(404, format!("unknown method {}", other)),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "reply failed");
            }
        }
    })?;
    peer.on(PeerEventKind::Notification, |event| {
        if let PeerEvent::Notification(notification) = event {
            tracing::info!(method = %notification.method, data = %notification.data, "notification");
        }
    })?;

    let joined: JoinResponse = peer
        .request(
            "join",
            JoinRequest {
                room: "lobby".to_string(),
                display_name: "relink demo".to_string(),
            },
        )
        .await?;
    tracing::info!(peers = joined.peers.len(), "joined room");

    tokio::signal::ctrl_c().await?;
    peer.close().await;
    Ok(())
}
