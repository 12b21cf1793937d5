//! Message envelopes exchanged between peers
//!
//! The protocol knows exactly four envelopes:
//!
//! 1. **Request**: a call that expects a response correlated by `id`
//! 2. **Notification**: a one-way message, no response expected
//! 3. **Success response**: answers a request with `data`
//! 4. **Error response**: answers a request with an error code and reason
//!
//! On the wire each envelope is a JSON object with one discriminant key
//! (`request`, `notification` or `response`). In memory the envelopes are an
//! explicit sum type, decided once by [`codec::parse`](crate::codec::parse),
//! so no code ever probes optional fields after decoding.
//!
//! # Payloads
//!
//! `data` is content-agnostic. It defaults to an empty JSON object whenever
//! it is absent or `null`, both on construction and on parse.
//!
//! # Examples
//!
//! ```rust
//! use relink_core::{Message, Response};
//! use serde_json::json;
//!
//! let request = Message::request("join", Some(json!({"room": "lobby"})));
//! let id = request.id().unwrap();
//!
//! let reply = Message::success(id, None);
//! assert_eq!(reply.id(), Some(id));
//! assert!(matches!(reply, Message::Response(Response::Success { .. })));
//! ```

use rand::Rng;
use serde_json::{Map, Value};

/// Correlation id linking a request to its response
pub type RequestId = u64;

/// Upper bound (inclusive) of generated request ids
pub const MAX_REQUEST_ID: RequestId = 10_000_000;

/// Generate a fresh positive request id
///
/// Ids are random rather than sequential. Collisions are possible and are
/// handled by whoever tracks in-flight requests.
pub fn generate_request_id() -> RequestId {
    rand::thread_rng().gen_range(1..=MAX_REQUEST_ID)
}

/// Normalise an optional payload, mapping absence and `null` to `{}`
pub fn default_data(data: Option<Value>) -> Value {
    match data {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value,
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id, always positive
    pub id: RequestId,
    /// Method name, opaque to the protocol
    pub method: String,
    /// Request payload
    pub data: Value,
}

impl Request {
    /// Create a request with a freshly generated id
    pub fn new(method: impl Into<String>, data: Option<Value>) -> Self {
        Self::with_id(generate_request_id(), method, data)
    }

    /// Create a request with a caller-chosen id
    pub fn with_id(id: RequestId, method: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            data: default_data(data),
        }
    }
}

/// Notification envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name, opaque to the protocol
    pub method: String,
    /// Notification payload
    pub data: Value,
}

impl Notification {
    /// Create a notification
    pub fn new(method: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            method: method.into(),
            data: default_data(data),
        }
    }
}

/// Response envelope, either success or error
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The request succeeded
    Success {
        /// Id of the answered request
        id: RequestId,
        /// Response payload
        data: Value,
    },
    /// The request failed on the remote side
    Error {
        /// Id of the answered request
        id: RequestId,
        /// Application error code
        error_code: i32,
        /// Human-readable reason
        error_reason: String,
    },
}

impl Response {
    /// Id of the request this response answers
    pub fn id(&self) -> RequestId {
        match self {
            Response::Success { id, .. } | Response::Error { id, .. } => *id,
        }
    }

    /// Whether this is a success response
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}

/// Any protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request expecting a response
    Request(Request),
    /// One-way notification
    Notification(Notification),
    /// Success or error response
    Response(Response),
}

impl Message {
    /// Create a request with a fresh random id
    pub fn request(method: impl Into<String>, data: Option<Value>) -> Self {
        Message::Request(Request::new(method, data))
    }

    /// Create a notification
    pub fn notification(method: impl Into<String>, data: Option<Value>) -> Self {
        Message::Notification(Notification::new(method, data))
    }

    /// Create a success response for the request `id`
    pub fn success(id: RequestId, data: Option<Value>) -> Self {
        Message::Response(Response::Success {
            id,
            data: default_data(data),
        })
    }

    /// Create an error response for the request `id`
    pub fn error(id: RequestId, error_code: i32, error_reason: impl Into<String>) -> Self {
        Message::Response(Response::Error {
            id,
            error_code,
            error_reason: error_reason.into(),
        })
    }

    /// Correlation id, if this message carries one
    pub fn id(&self) -> Option<RequestId> {
        match self {
            Message::Request(request) => Some(request.id),
            Message::Notification(_) => None,
            Message::Response(response) => Some(response.id()),
        }
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }

    /// Check if this message is a request
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    /// Check if this message is a notification
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }

    /// Check if this message is a response
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Notification> for Message {
    fn from(notification: Notification) -> Self {
        Message::Notification(notification)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
