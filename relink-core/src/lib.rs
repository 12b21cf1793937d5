//! Core message protocol and error types for relink
//!
//! This crate holds everything that does not depend on a live connection:
//!
//! - **Message**: the four protocol envelopes (request, notification,
//!   success response, error response)
//! - **Codec**: conversion between wire text and envelopes
//! - **Error handling**: the workspace-wide error enum
//! - **Observability**: opt-in `tracing`/OpenTelemetry initialisation
//!
//! The `relink-client` crate builds the reconnecting transport and the
//! request/response peer on top of it.
//!
//! # Example
//!
//! ```rust
//! use relink_core::{codec, Message};
//! use serde_json::json;
//!
//! let request = Message::request("join", Some(json!({"room": "lobby"})));
//! let text = codec::encode(&request).unwrap();
//!
//! let decoded = codec::parse(&text).unwrap();
//! assert_eq!(decoded.method(), Some("join"));
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod observability;

pub use error::{Error, Result};
pub use message::{Message, Notification, Request, RequestId, Response};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
