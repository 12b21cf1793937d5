//! Request/response peer over a reconnecting transport
//!
//! A [`Peer`] sits on top of a [`Transport`]. It correlates outbound
//! requests with their responses, surfaces inbound requests and
//! notifications, and re-emits the transport lifecycle as [`PeerEvent`]s.
//!
//! # Request Lifecycle
//!
//! 1. **Check**: fail fast when closed or (unless waiting is enabled) not
//!    connected
//! 2. **Register**: store a pending entry under a random id
//! 3. **Send**: write the request envelope
//! 4. **Wait**: race the response against the request timeout
//! 5. **Complete**: a success response resolves with its data, an error
//!    response rejects with `Error::Remote`, the timeout rejects with
//!    `Error::RequestTimeout`, and closing the peer rejects with
//!    `Error::PeerClosed`
//!
//! Pending requests survive a `Disconnected` event: the response may still
//! arrive on the next socket, otherwise the timeout settles them.
//!
//! # Examples
//!
//! ```rust,no_run
//! use relink_client::{Peer, PeerEvent, PeerEventKind, PeerOptions, Transport, TransportOptions};
//! use serde_json::{json, Value};
//!
//! # async fn example() -> relink_core::Result<()> {
//! let transport = Transport::new("ws://localhost:4443", TransportOptions::default())?;
//! let peer = Peer::new(transport, PeerOptions::default().with_wait_for_connection(true))?;
//!
//! peer.on(PeerEventKind::Request, |event| {
//!     if let PeerEvent::Request(request) = event {
//!         let _ = request.accept(json!({"pong": true}));
//!     }
//! })?;
//!
//! let rooms: Value = peer.request("listRooms", json!({})).await?;
//! peer.notify("hello", json!({"name": "alice"})).await?;
//! peer.close().await;
//! # Ok(())
//! # }
//! ```

use crate::connection_state::ConnectionState;
use crate::events::{Event, EventEmitter, ListenerId};
use crate::metrics::PeerMetrics;
use crate::request::RequestManager;
use crate::transport::{Transport, TransportEvent, TransportEventKind};
use relink_core::message::generate_request_id;
use relink_core::{codec, Error, Message, Notification, Request, RequestId, Response, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Default time to wait for a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error code sent back when a request listener panics before replying
const LISTENER_FAILURE_CODE: i32 = 500;

/// Peer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PeerOptions {
    /// Time to wait for a response
    pub request_timeout: Duration,
    /// Wait for the transport to open instead of failing with
    /// `Error::NotConnected`
    pub wait_for_connection: bool,
    /// Maximum listeners per event kind
    pub max_listeners: Option<usize>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            wait_for_connection: false,
            max_listeners: None,
        }
    }
}

impl PeerOptions {
    /// Create the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Wait for the connection when requesting while disconnected
    pub fn with_wait_for_connection(mut self, wait: bool) -> Self {
        self.wait_for_connection = wait;
        self
    }

    /// Limit the listeners per event kind
    pub fn with_max_listeners(mut self, max: usize) -> Self {
        self.max_listeners = Some(max);
        self
    }
}

/// Events emitted by a peer
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The transport opened a socket
    Open,
    /// A connect attempt failed
    Failed {
        /// Attempt number within the current connect cycle
        attempt: u32,
    },
    /// The open socket was lost; reconnecting
    Disconnected,
    /// The peer closed
    Close,
    /// The remote side sent a request
    Request(InboundRequest),
    /// The remote side sent a notification
    Notification(Notification),
}

/// Kinds of [`PeerEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    Open,
    Failed,
    Disconnected,
    Close,
    Request,
    Notification,
}

impl Event for PeerEvent {
    type Kind = PeerEventKind;

    fn kind(&self) -> PeerEventKind {
        match self {
            PeerEvent::Open => PeerEventKind::Open,
            PeerEvent::Failed { .. } => PeerEventKind::Failed,
            PeerEvent::Disconnected => PeerEventKind::Disconnected,
            PeerEvent::Close => PeerEventKind::Close,
            PeerEvent::Request(_) => PeerEventKind::Request,
            PeerEvent::Notification(_) => PeerEventKind::Notification,
        }
    }
}

/// A request received from the remote side
///
/// Reply once with [`accept`](Self::accept) or [`reject`](Self::reject).
/// Clones share the reply slot.
#[derive(Clone)]
pub struct InboundRequest {
    request: Request,
    transport: Transport,
    answered: Arc<AtomicBool>,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("request", &self.request)
            .field("answered", &self.is_answered())
            .finish()
    }
}

impl InboundRequest {
    fn new(request: Request, transport: Transport) -> Self {
        Self {
            request,
            transport,
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Correlation id
    pub fn id(&self) -> RequestId {
        self.request.id
    }

    /// Method name
    pub fn method(&self) -> &str {
        &self.request.method
    }

    /// Raw request data
    pub fn data(&self) -> &Value {
        &self.request.data
    }

    /// Request data deserialized into `T`
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.request.data.clone())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// The underlying request envelope
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Whether a reply was already sent
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Reply with a success response
    ///
    /// The response is queued on the open socket. If that socket drops
    /// before the write completes the response is lost.
    ///
    /// # Errors
    ///
    /// - `Error::Internal` if the request was already answered
    /// - `Error::TransportClosed` if the transport is closed
    /// - `Error::NotConnected` if no socket is open; the request stays
    ///   unanswered
    pub fn accept<T: Serialize>(&self, data: T) -> Result<()> {
        let data = serde_json::to_value(data).map_err(|e| Error::Serialization(e.to_string()))?;
        self.reply(Message::success(self.request.id, Some(data)))
    }

    /// Reply with an error response
    ///
    /// Fails like [`accept`](Self::accept).
    pub fn reject(&self, code: i32, reason: impl Into<String>) -> Result<()> {
        self.reply(Message::error(self.request.id, code, reason))
    }

    fn reply(&self, response: Message) -> Result<()> {
        let already_answered = || {
            Error::Internal(format!("request {} already answered", self.request.id))
        };

        if self.is_answered() {
            return Err(already_answered());
        }
        if self.transport.is_closed() {
            return Err(Error::TransportClosed);
        }
        if !self.transport.is_connected() {
            return Err(Error::NotConnected);
        }

        let payload = codec::encode(&response)?;
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(already_answered());
        }
        self.transport.try_send(payload)
    }
}

struct PeerInner {
    transport: Transport,
    options: PeerOptions,
    requests: RequestManager,
    events: EventEmitter<PeerEvent>,
    closed: AtomicBool,
    shut_down: AtomicBool,
    data: Mutex<Map<String, Value>>,
    metrics: Option<Arc<PeerMetrics>>,
}

/// Request/response peer
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("transport", &self.inner.transport)
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl Peer {
    /// Create a peer and start connecting its transport
    ///
    /// # Errors
    ///
    /// Returns `Error::MaxListeners` if the transport cannot take the
    /// peer's listeners.
    pub fn new(transport: Transport, options: PeerOptions) -> Result<Self> {
        Self::with_metrics(transport, options, None)
    }

    pub(crate) fn with_metrics(
        transport: Transport,
        options: PeerOptions,
        metrics: Option<Arc<PeerMetrics>>,
    ) -> Result<Self> {
        let events = match options.max_listeners {
            Some(max) => EventEmitter::with_max_listeners(max),
            None => EventEmitter::new(),
        };

        let inner = Arc::new(PeerInner {
            transport,
            options,
            requests: RequestManager::new(),
            events,
            closed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            data: Mutex::new(Map::new()),
            metrics,
        });

        attach(&inner)?;
        inner.transport.connect();

        Ok(Self { inner })
    }

    /// The underlying transport
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Whether the peer is closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the transport has an open socket
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.inner.transport.is_connected()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count()
    }

    /// Wait until the transport has an open socket
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        self.inner
            .transport
            .wait_until_open(timeout)
            .await
            .map_err(closed_as_peer_closed)
    }

    /// Application data attached to the peer
    pub fn data(&self) -> Map<String, Value> {
        self.lock_data().clone()
    }

    /// Replace the application data
    pub fn set_data(&self, data: Map<String, Value>) {
        *self.lock_data() = data;
    }

    /// Insert one application data entry, returning the previous value
    pub fn insert_data(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.lock_data().insert(key.into(), value)
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an event listener
    pub fn on<F>(&self, kind: PeerEventKind, listener: F) -> Result<ListenerId>
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Remove an event listener
    pub fn off(&self, kind: PeerEventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    /// The event registry
    pub fn events(&self) -> &EventEmitter<PeerEvent> {
        &self.inner.events
    }

    /// Send a request and wait for its response with the default timeout
    pub async fn request<P, R>(&self, method: impl Into<String> + AsRef<str>, data: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let timeout = self.inner.options.request_timeout;
        self.request_with_timeout(method, data, timeout).await
    }

    /// Send a request and wait for its response
    ///
    /// `timeout` bounds the whole call, including any wait for the socket
    /// to open.
    ///
    /// # Errors
    ///
    /// - `Error::PeerClosed` if the peer is or becomes closed
    /// - `Error::NotConnected` if no socket is open and waiting is disabled,
    ///   or the socket did not open within `timeout`
    /// - `Error::RequestTimeout` if no response arrived within `timeout`
    /// - `Error::Remote` if the remote side rejected the request
    /// - `Error::Serialization` if `data` or the response data do not fit
    #[tracing::instrument(skip(self, data, timeout), fields(method = %method.as_ref()))]
    pub async fn request_with_timeout<P, R>(
        &self,
        method: impl Into<String> + AsRef<str>,
        data: P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let start = Instant::now();
        let method = method.into();

        let outcome = self.exchange(&method, data, timeout).await;
        let duration = start.elapsed().as_secs_f64();

        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                if let Some(ref m) = self.inner.metrics {
                    m.record_request(&method, status_label(&error), duration);
                    m.record_error(status_label(&error));
                }
                tracing::warn!(method = %method, error = %error, "Request failed");
                return Err(error);
            }
        };

        let result: R =
            serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))?;

        if let Some(ref m) = self.inner.metrics {
            m.record_request(&method, "success", duration);
        }
        tracing::debug!(method = %method, duration_secs = duration, "Request completed");

        Ok(result)
    }

    async fn exchange<P: Serialize>(&self, method: &str, data: P, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        let deadline = tokio::time::Instant::now() + timeout;

        let data = serde_json::to_value(data).map_err(|e| Error::Serialization(e.to_string()))?;

        if !self.inner.transport.is_connected() {
            if !self.inner.options.wait_for_connection {
                return Err(Error::NotConnected);
            }
            tracing::debug!("Waiting for connection");
            self.inner
                .transport
                .wait_until_open(timeout)
                .await
                .map_err(closed_as_peer_closed)?;
        }

        let requests = &self.inner.requests;
        let (id, mut rx) = requests.register(generate_request_id(), method);
        let _guard = PendingGuard { requests, id };

        let message = Message::Request(Request::with_id(id, method, Some(data)));
        let payload = codec::encode(&message)?;
        self.inner
            .transport
            .send(payload)
            .await
            .map_err(closed_as_peer_closed)?;

        tracing::debug!(id, "Request sent, waiting for response");

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::PeerClosed),
            Err(_) => {
                if requests.remove(id) {
                    return Err(Error::RequestTimeout);
                }
                // Completed between the deadline and the removal
                rx.try_recv().unwrap_or(Err(Error::RequestTimeout))
            }
        }
    }

    /// Send a notification
    ///
    /// # Errors
    ///
    /// `Error::PeerClosed` if the peer is closed, `Error::NotConnected` if
    /// no socket is open.
    #[tracing::instrument(skip(self, data), fields(method = %method.as_ref()))]
    pub async fn notify<P>(&self, method: impl Into<String> + AsRef<str>, data: P) -> Result<()>
    where
        P: Serialize,
    {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }

        let data = serde_json::to_value(data).map_err(|e| Error::Serialization(e.to_string()))?;
        let message = Message::notification(method, Some(data));

        self.inner
            .transport
            .send_message(&message)
            .await
            .map_err(closed_as_peer_closed)
    }

    /// Close the peer and its transport
    ///
    /// Idempotent. Every pending request is rejected with
    /// `Error::PeerClosed`, then `Close` is emitted.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Closing peer");
        self.inner.transport.close().await;
        self.inner.shutdown();
    }
}

struct PendingGuard<'a> {
    requests: &'a RequestManager,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.requests.remove(self.id);
    }
}

fn closed_as_peer_closed(error: Error) -> Error {
    match error {
        Error::TransportClosed => Error::PeerClosed,
        other => other,
    }
}

fn status_label(error: &Error) -> &'static str {
    match error {
        Error::RequestTimeout => "timeout",
        Error::PeerClosed => "closed",
        Error::NotConnected => "not_connected",
        Error::Remote { .. } => "remote_error",
        _ => "error",
    }
}

fn attach(inner: &Arc<PeerInner>) -> Result<()> {
    let transport = &inner.transport;

    let weak = Arc::downgrade(inner);
    transport.on(TransportEventKind::Open, move |_| {
        with_inner(&weak, |inner| inner.on_open());
    })?;

    let weak = Arc::downgrade(inner);
    transport.on(TransportEventKind::Failed, move |event| {
        if let TransportEvent::Failed { attempt } = event {
            let attempt = *attempt;
            with_inner(&weak, |inner| inner.on_failed(attempt));
        }
    })?;

    let weak = Arc::downgrade(inner);
    transport.on(TransportEventKind::Disconnected, move |_| {
        with_inner(&weak, |inner| inner.on_disconnected());
    })?;

    let weak = Arc::downgrade(inner);
    transport.on(TransportEventKind::Close, move |_| {
        with_inner(&weak, |inner| {
            inner.closed.store(true, Ordering::SeqCst);
            inner.shutdown();
        });
    })?;

    let weak = Arc::downgrade(inner);
    transport.on(TransportEventKind::Message, move |event| {
        if let TransportEvent::Message(message) = event {
            with_inner(&weak, |inner| inner.on_message(message.clone()));
        }
    })?;

    Ok(())
}

fn with_inner(weak: &Weak<PeerInner>, f: impl FnOnce(&PeerInner)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

impl PeerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record_state(&self, state: ConnectionState) {
        if let Some(ref m) = self.metrics {
            m.update_connection_state(state);
        }
    }

    fn on_open(&self) {
        if self.is_closed() {
            return;
        }
        tracing::info!("Peer connected");
        self.record_state(ConnectionState::Open);
        self.events.safe_emit(&PeerEvent::Open);
    }

    fn on_failed(&self, attempt: u32) {
        if self.is_closed() {
            return;
        }
        if let Some(ref m) = self.metrics {
            m.record_connect_failure(attempt);
        }
        self.events.safe_emit(&PeerEvent::Failed { attempt });
    }

    fn on_disconnected(&self) {
        if self.is_closed() {
            return;
        }
        tracing::info!(pending = self.requests.pending_count(), "Peer disconnected");
        if let Some(ref m) = self.metrics {
            m.record_disconnect();
            m.update_connection_state(ConnectionState::Disconnected);
        }
        self.events.safe_emit(&PeerEvent::Disconnected);
    }

    fn on_message(&self, message: Message) {
        if self.is_closed() {
            return;
        }

        match message {
            Message::Response(response) => self.on_response(response),
            Message::Request(request) => self.on_request(request),
            Message::Notification(notification) => {
                tracing::debug!(method = %notification.method, "Notification received");
                if let Some(ref m) = self.metrics {
                    m.record_notification(&notification.method);
                }
                self.events.safe_emit(&PeerEvent::Notification(notification));
            }
        }
    }

    fn on_response(&self, response: Response) {
        let id = response.id();
        match self.requests.complete(response) {
            Some(method) => tracing::debug!(id, method = %method, "Response received"),
            None => tracing::debug!(id, "Ignoring response for unknown request"),
        }
    }

    fn on_request(&self, request: Request) {
        tracing::debug!(id = request.id, method = %request.method, "Request received");
        if let Some(ref m) = self.metrics {
            m.record_inbound_request(&request.method);
        }

        let inbound = InboundRequest::new(request, self.transport.clone());
        let panicked = self.events.safe_emit(&PeerEvent::Request(inbound.clone()));

        if panicked > 0 && !inbound.is_answered() {
            if let Err(e) = inbound.reject(LISTENER_FAILURE_CODE, "request listener failed") {
                tracing::debug!(error = %e, "Cannot reject failed request");
            }
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let pending = self.requests.pending_count();
        self.requests.fail_all(Error::PeerClosed);
        self.record_state(ConnectionState::Closed);
        tracing::info!(rejected = pending, "Peer closed");
        self.events.safe_emit(&PeerEvent::Close);
    }
}
