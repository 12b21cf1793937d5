//! relink - reconnecting request/response messaging over WebSocket
//!
//! This is the convenience crate re-exporting the relink sub-crates. Use it
//! for a single dependency covering both the protocol types and the client.
//!
//! # Architecture
//!
//! - **relink-core**: message envelopes, codec, error handling, observability
//! - **relink-client**: backoff, retry operation, event emitter, transport
//!   and peer
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use relink::{PeerBuilder, PeerEvent, PeerEventKind};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let peer = PeerBuilder::new("ws://localhost:4443").connect().await?;
//!
//!     peer.on(PeerEventKind::Request, |event| {
//!         if let PeerEvent::Request(request) = event {
//!             let _ = request.accept(json!({}));
//!         }
//!     })?;
//!
//!     let result: Value = peer.request("getRouterRtpCapabilities", json!({})).await?;
//!     println!("Result: {}", result);
//!
//!     peer.close().await;
//!     Ok(())
//! }
//! ```

pub use relink_client as client;
pub use relink_core as core;

pub use relink_client::{Peer, PeerBuilder, PeerEvent, PeerEventKind, Transport, TransportOptions};
pub use relink_core::{Error, Message, Result};
