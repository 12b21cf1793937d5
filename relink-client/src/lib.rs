//! Reconnecting WebSocket transport and request/response peer
//!
//! This crate provides the connection-facing half of relink: a transport
//! that keeps one WebSocket alive with configurable backoff, and a peer
//! that runs a request/response and notification protocol over it.
//!
//! # Core Features
//!
//! - **Backoff**: exponential (optionally randomized) or literal delay
//!   schedules
//! - **Retry operation**: one connect cycle with forever mode, a maximum
//!   retry time and a per-attempt watchdog
//! - **Transport**: single live socket, terminal closure on code 4000,
//!   lifecycle events
//! - **Peer**: correlated requests with timeouts, inbound requests with
//!   accept/reject, notifications
//! - **Observability**: OpenTelemetry metrics when enabled through the
//!   builder
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use relink_client::{PeerBuilder, PeerEvent, PeerEventKind};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let peer = PeerBuilder::new("ws://localhost:4443/?peerId=alice")
//!         .wait_for_connection(true)
//!         .build()?;
//!
//!     peer.on(PeerEventKind::Notification, |event| {
//!         if let PeerEvent::Notification(notification) = event {
//!             println!("{}: {}", notification.method, notification.data);
//!         }
//!     })?;
//!
//!     let room: Value = peer.request("join", json!({"room": "lobby"})).await?;
//!     println!("Joined: {}", room);
//!
//!     peer.close().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod connection_state;
pub mod events;
mod metrics;
mod peer;
mod peer_builder;
mod request;
mod retry;
mod transport;

pub use backoff::{compute_delays, Backoff, BackoffConfig, DEFAULT_FACTOR, DEFAULT_MIN_DELAY, DEFAULT_RETRIES};
pub use connection_state::{ConnectionState, ConnectionTracker};
pub use events::{Event, EventEmitter, ListenerId};
pub use metrics::PeerMetrics;
pub use peer::{InboundRequest, Peer, PeerEvent, PeerEventKind, PeerOptions, DEFAULT_REQUEST_TIMEOUT};
pub use peer_builder::PeerBuilder;
pub use request::RequestManager;
pub use retry::{RetryOperation, RetryOptions};
pub use transport::{
    Transport, TransportEvent, TransportEventKind, TransportOptions, ABNORMAL_CLOSURE_CODE,
    SERVER_CLOSE_CODE,
};
