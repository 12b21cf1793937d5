//! Error types for relink
//!
//! Every fallible operation in the workspace returns [`Result`], whose error
//! side is the single [`Error`] enum defined here.
//!
//! # Error Categories
//!
//! - **Configuration**: `Config` is returned synchronously when a backoff
//!   policy is constructed with inconsistent bounds.
//! - **Wire format**: `Syntax` (the frame is not JSON) and `Parse` (the JSON
//!   is not one of the four envelopes). The transport drops both silently.
//! - **Lifecycle**: `TransportClosed`, `PeerClosed` and `NotConnected` are
//!   returned to callers that use a component in the wrong state.
//! - **Requests**: `RequestTimeout` and `Remote` complete a single pending
//!   request without affecting the connection.
//! - **Retry bookkeeping**: `RetryTimeout` is recorded by a retry operation
//!   once its maximum retry time has elapsed.
//!
//! # Examples
//!
//! ```rust
//! use relink_core::Error;
//!
//! let error = Error::Remote { code: 404, reason: "no such room".into() };
//! assert_eq!(error.to_string(), "Remote error [404]: no such room");
//! ```

use thiserror::Error;

/// Result type for relink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application-level error type for relink operations
///
/// The enum is `Clone` so that a retry operation can keep a log of the
/// failures it observed and hand out a representative one afterwards, and
/// `PartialEq` so callers can match on outcomes in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid backoff or retry configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The raw frame is not well-formed JSON
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// The JSON value is not a recognised message envelope
    ///
    /// Covers both an object without any discriminant key and a
    /// discriminated object whose fields have the wrong shape.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization or deserialization of a payload failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// WebSocket transport layer error
    ///
    /// Socket errors are informational: the closure that follows them is
    /// what decides whether the transport reconnects.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The transport was closed and accepts no more frames
    #[error("Transport closed")]
    TransportClosed,

    /// The peer was closed
    ///
    /// Returned by `request`/`notify` after close, and used to reject every
    /// request still pending when the peer closes.
    #[error("Peer closed")]
    PeerClosed,

    /// No socket is currently open
    #[error("Not connected")]
    NotConnected,

    /// A request received no response in time
    #[error("Request timeout")]
    RequestTimeout,

    /// The remote side answered a request with an error response
    #[error("Remote error [{code}]: {reason}")]
    Remote {
        /// Error code carried by the response
        code: i32,
        /// Human-readable reason carried by the response
        reason: String,
    },

    /// Synthetic failure recorded once the maximum retry time elapsed
    #[error("Retry operation timeout occurred")]
    RetryTimeout,

    /// An event already has the maximum number of listeners
    #[error("Event {event} exceeds max listeners ({max})")]
    MaxListeners {
        /// Name of the event kind
        event: String,
        /// The configured listener limit
        max: usize,
    },

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is the outcome of closing the transport or peer
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::TransportClosed | Error::PeerClosed)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
