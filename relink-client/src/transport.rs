//! Reconnecting WebSocket transport
//!
//! A [`Transport`] keeps at most one live socket to a URL. It uses a
//! [`RetryOperation`] to establish the socket, classifies every closure as
//! terminal or retryable, and reports its lifecycle as [`TransportEvent`]s.
//!
//! # Actor Model
//!
//! All mutable state lives in a single actor task. Socket callbacks
//! (connected, frame, error, closed), retry timer firings, watchdogs,
//! `send` and `close` are commands on one mailbox, processed in order.
//! Every connect cycle and every socket carries a sequence number, so a
//! command from a superseded cycle or socket is a no-op.
//!
//! # Closure Classification
//!
//! | situation                         | outcome                                   |
//! |-----------------------------------|-------------------------------------------|
//! | code 4000                         | terminal `Close`                          |
//! | attempt never opened             | `Failed`, then retry or terminal `Close`  |
//! | open socket lost                  | `Disconnected`, then a fresh connect cycle |
//! | [`Transport::close`]              | `Close`, no further events                |
//!
//! Connect failures and streams that end without a close frame count as
//! code 1006.
//!
//! # Examples
//!
//! ```rust,no_run
//! use relink_client::{Transport, TransportEvent, TransportEventKind, TransportOptions};
//!
//! # async fn example() -> relink_core::Result<()> {
//! let transport = Transport::new("ws://localhost:4443", TransportOptions::default())?;
//!
//! transport.on(TransportEventKind::Message, |event| {
//!     if let TransportEvent::Message(message) = event {
//!         println!("received {:?}", message);
//!     }
//! })?;
//!
//! transport.connect();
//! transport.wait_until_open(std::time::Duration::from_secs(5)).await?;
//! transport.send(r#"{"notification":true,"method":"hello","data":{}}"#).await?;
//! transport.close().await;
//! # Ok(())
//! # }
//! ```

use crate::backoff::{Backoff, BackoffConfig};
use crate::connection_state::{ConnectionState, ConnectionTracker};
use crate::events::{Event, EventEmitter, ListenerId};
use crate::retry::{RetryOperation, RetryOptions};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relink_core::{codec, Error, Message, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::Instrument;

/// Closure code sent by a server that ended the session for good
pub const SERVER_CLOSE_CODE: u16 = 4000;

/// Closure code for connections lost without a close frame
pub const ABNORMAL_CLOSURE_CODE: u16 = 1006;

/// Closure code for a close frame without a status
const NO_STATUS_CODE: u16 = 1005;

/// Upper bound for flushing the close frame on `close`
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Value of the `Sec-WebSocket-Protocol` request header
    pub sub_protocol: Option<String>,
    /// Delay schedule between connect attempts
    pub backoff: Backoff,
    /// Retry operation options
    pub retry: RetryOptions,
    /// Treat an attempt that has not opened within this duration as failed
    pub connect_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            sub_protocol: None,
            backoff: Backoff::Exponential(
                BackoffConfig::default().with_max_delay(Duration::from_millis(8000)),
            ),
            retry: RetryOptions::default(),
            connect_timeout: None,
        }
    }
}

impl TransportOptions {
    /// Create the default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a WebSocket sub-protocol
    pub fn with_sub_protocol(mut self, sub_protocol: impl Into<String>) -> Self {
        self.sub_protocol = Some(sub_protocol.into());
        self
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.backoff = backoff.into();
        self
    }

    /// Set the retry options
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-attempt connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Lifecycle and message events of a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A socket opened
    Open,
    /// A connect attempt ended before the socket opened
    Failed {
        /// Attempt number within the current connect cycle
        attempt: u32,
    },
    /// An open socket was lost; a new connect cycle follows
    Disconnected,
    /// The transport closed for good
    Close {
        /// Closure code, `None` when closed locally
        code: Option<u16>,
        /// Most frequent failure of the last connect cycle
        cause: Option<Error>,
    },
    /// A well-formed message arrived
    Message(Message),
}

/// Kinds of [`TransportEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Open,
    Failed,
    Disconnected,
    Close,
    Message,
}

impl Event for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Open => TransportEventKind::Open,
            TransportEvent::Failed { .. } => TransportEventKind::Failed,
            TransportEvent::Disconnected => TransportEventKind::Disconnected,
            TransportEvent::Close { .. } => TransportEventKind::Close,
            TransportEvent::Message(_) => TransportEventKind::Message,
        }
    }
}

enum Command {
    Start,
    Send {
        payload: String,
        reply: oneshot::Sender<Result<()>>,
    },
    TrySend {
        payload: String,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
    Attempt {
        operation: u64,
        attempt: u32,
    },
    AttemptTimeout {
        operation: u64,
        attempt: u32,
    },
    Connected {
        socket: u64,
        stream: Box<WsStream>,
    },
    ConnectFailed {
        socket: u64,
        error: String,
    },
    Frame {
        socket: u64,
        text: String,
    },
    SocketError {
        socket: u64,
        error: String,
    },
    SocketClosed {
        socket: u64,
        code: u16,
    },
}

type CommandTx = mpsc::UnboundedSender<Command>;
type WeakCommandTx = mpsc::WeakUnboundedSender<Command>;

fn post(commands: &WeakCommandTx, command: Command) {
    if let Some(commands) = commands.upgrade() {
        let _ = commands.send(command);
    }
}

/// Handle to a reconnecting WebSocket transport
///
/// Cloning yields another handle to the same transport. The actor stops
/// once the transport is closed or every handle is dropped.
#[derive(Clone)]
pub struct Transport {
    url: Arc<str>,
    commands: CommandTx,
    state: ConnectionTracker,
    events: EventEmitter<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.url)
            .field("state", &self.state.state())
            .finish()
    }
}

impl Transport {
    /// Create a transport and spawn its actor
    ///
    /// No connection is attempted until [`connect`](Self::connect), so
    /// listeners can be registered without missing events. Must be called
    /// within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid backoff policy, URL or
    /// sub-protocol.
    pub fn new(url: impl Into<String>, options: TransportOptions) -> Result<Self> {
        let url: String = url.into();
        options.backoff.validate()?;
        build_request(&url, options.sub_protocol.as_deref())?;

        let (tx, rx) = mpsc::unbounded_channel();
        let state = ConnectionTracker::new();
        let events = EventEmitter::new();
        let closed = Arc::new(AtomicBool::new(false));

        let actor = Actor {
            url: url.clone(),
            options,
            commands: tx.downgrade(),
            state: state.clone(),
            events: events.clone(),
            closed: closed.clone(),
            started: false,
            terminated: false,
            operation: None,
            operation_seq: 0,
            socket: None,
            socket_seq: 0,
        };

        let span = tracing::info_span!("transport", url = %url);
        tokio::spawn(actor.run(rx).instrument(span));

        Ok(Self {
            url: url.into(),
            commands: tx,
            state,
            events,
            closed,
        })
    }

    /// Start the first connect cycle
    ///
    /// Idempotent; does nothing once closed.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// The URL this transport connects to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    /// Whether a socket is open
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.state.is_open()
    }

    /// Whether the transport is closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to connection state changes
    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until a socket is open
    ///
    /// # Errors
    ///
    /// `Error::TransportClosed` if the transport closes first,
    /// `Error::NotConnected` if `timeout` elapses first.
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        self.state.wait_until_open(timeout).await
    }

    /// Register an event listener
    pub fn on<F>(&self, kind: TransportEventKind, listener: F) -> Result<ListenerId>
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    /// Remove an event listener
    pub fn off(&self, kind: TransportEventKind, id: ListenerId) -> bool {
        self.events.off(kind, id)
    }

    /// The event registry
    pub fn events(&self) -> &EventEmitter<TransportEvent> {
        &self.events
    }

    /// Write a text frame to the open socket
    ///
    /// # Errors
    ///
    /// - `Error::TransportClosed` once the transport is closed
    /// - `Error::NotConnected` when no socket is open
    /// - `Error::WebSocket` when the write fails
    pub async fn send(&self, payload: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload: payload.into(),
                reply,
            })
            .map_err(|_| Error::TransportClosed)?;

        rx.await.map_err(|_| Error::TransportClosed)?
    }

    /// Encode and send a message
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        let payload = codec::encode(message)?;
        self.send(payload).await
    }

    /// Queue a text frame without waiting for the write
    ///
    /// Write failures are logged by the actor.
    ///
    /// # Errors
    ///
    /// `Error::TransportClosed` once the transport is closed.
    pub fn try_send(&self, payload: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        self.commands
            .send(Command::TrySend {
                payload: payload.into(),
            })
            .map_err(|_| Error::TransportClosed)
    }

    /// Close the transport
    ///
    /// Idempotent. Returns once the actor has applied the close, after
    /// which no `Open` event can be emitted.
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).is_ok() {
            let _ = rx.await;
        }
    }
}

fn build_request(url: &str, sub_protocol: Option<&str>) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Config(format!("invalid url {}: {}", url, e)))?;

    if let Some(sub_protocol) = sub_protocol {
        let value = HeaderValue::from_str(sub_protocol)
            .map_err(|e| Error::Config(format!("invalid sub-protocol: {}", e)))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }

    Ok(request)
}

struct Socket {
    id: u64,
    attempt: u32,
    opened: bool,
    sink: Option<WsSink>,
    last_error: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Socket {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Actor {
    url: String,
    options: TransportOptions,
    commands: WeakCommandTx,
    state: ConnectionTracker,
    events: EventEmitter<TransportEvent>,
    closed: Arc<AtomicBool>,
    started: bool,
    terminated: bool,
    operation: Option<RetryOperation>,
    operation_seq: u64,
    socket: Option<Socket>,
    socket_seq: u64,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Start => self.start(),
                Command::Send { payload, reply } => {
                    let result = self.write(payload).await;
                    let _ = reply.send(result);
                }
                Command::TrySend { payload } => {
                    if let Err(e) = self.write(payload).await {
                        tracing::debug!(error = %e, "Dropped queued frame");
                    }
                }
                Command::Close { ack } => {
                    self.close().await;
                    let _ = ack.send(());
                }
                Command::Attempt { operation, attempt } => self.on_attempt(operation, attempt),
                Command::AttemptTimeout { operation, attempt } => {
                    self.on_attempt_timeout(operation, attempt)
                }
                Command::Connected { socket, stream } => self.on_connected(socket, *stream),
                Command::ConnectFailed { socket, error } => {
                    self.on_socket_closed(socket, ABNORMAL_CLOSURE_CODE, Some(error))
                }
                Command::Frame { socket, text } => self.on_frame(socket, text),
                Command::SocketError { socket, error } => self.on_socket_error(socket, error),
                Command::SocketClosed { socket, code } => self.on_socket_closed(socket, code, None),
            }

            if self.terminated {
                break;
            }
        }

        if let Some(operation) = self.operation.take() {
            operation.stop();
        }
        self.socket = None;
        tracing::debug!("Transport actor stopped");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_current(&self, socket: u64) -> bool {
        self.socket.as_ref().map(|s| s.id) == Some(socket)
    }

    fn start(&mut self) {
        if self.started || self.is_closed() {
            return;
        }
        self.started = true;
        self.start_cycle();
    }

    fn start_cycle(&mut self) {
        let operation =
            match RetryOperation::from_backoff(&self.options.backoff, self.options.retry.clone()) {
                Ok(operation) => operation,
                Err(e) => {
                    tracing::error!(error = %e, "Cannot build retry operation");
                    self.terminate(None);
                    return;
                }
            };

        self.operation_seq += 1;
        let operation_id = self.operation_seq;
        self.operation = Some(operation.clone());

        let commands = self.commands.clone();
        let on_attempt = move |attempt| {
            post(
                &commands,
                Command::Attempt {
                    operation: operation_id,
                    attempt,
                },
            )
        };

        match self.options.connect_timeout {
            Some(timeout) => {
                let commands = self.commands.clone();
                operation.attempt_with_timeout(on_attempt, timeout, move |attempt| {
                    post(
                        &commands,
                        Command::AttemptTimeout {
                            operation: operation_id,
                            attempt,
                        },
                    )
                });
            }
            None => operation.attempt(on_attempt),
        }
    }

    fn on_attempt(&mut self, operation: u64, attempt: u32) {
        if self.is_closed() {
            if let Some(operation) = self.operation.take() {
                operation.stop();
            }
            return;
        }
        if operation != self.operation_seq || self.operation.is_none() {
            return;
        }

        self.socket_seq += 1;
        let socket = self.socket_seq;
        tracing::debug!(attempt, "Connecting");

        let request = build_request(&self.url, self.options.sub_protocol.as_deref());
        let commands = self.commands.clone();
        let connector = tokio::spawn(async move {
            let result = match request {
                Ok(request) => connect_async(request).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok((stream, _response)) => post(
                    &commands,
                    Command::Connected {
                        socket,
                        stream: Box::new(stream),
                    },
                ),
                Err(error) => post(&commands, Command::ConnectFailed { socket, error }),
            }
        });

        self.socket = Some(Socket {
            id: socket,
            attempt,
            opened: false,
            sink: None,
            last_error: None,
            tasks: vec![connector],
        });
    }

    fn on_attempt_timeout(&mut self, operation: u64, attempt: u32) {
        if self.is_closed() || operation != self.operation_seq {
            return;
        }

        let pending = self
            .socket
            .as_ref()
            .filter(|socket| !socket.opened && socket.attempt == attempt)
            .map(|socket| socket.id);

        if let Some(socket) = pending {
            tracing::debug!(attempt, "Connect attempt timed out");
            self.on_socket_closed(
                socket,
                ABNORMAL_CLOSURE_CODE,
                Some("connect attempt timed out".to_string()),
            );
        }
    }

    fn on_connected(&mut self, socket: u64, stream: WsStream) {
        if self.is_closed() || !self.is_current(socket) {
            return;
        }

        let (sink, stream) = stream.split();
        let reader = tokio::spawn(read_socket(socket, stream, self.commands.clone()));

        if let Some(current) = self.socket.as_mut() {
            current.opened = true;
            current.sink = Some(sink);
            current.tasks.push(reader);
        }

        self.state.set(ConnectionState::Open);
        tracing::info!("Transport open");
        self.events.safe_emit(&TransportEvent::Open);

        if let Some(operation) = self.operation.take() {
            operation.stop();
        }
    }

    fn on_frame(&mut self, socket: u64, text: String) {
        if self.is_closed() || !self.is_current(socket) {
            return;
        }

        let message = match codec::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        if self.events.listener_count(TransportEventKind::Message) == 0 {
            tracing::debug!("No message listener, dropping message");
            return;
        }

        self.events.safe_emit(&TransportEvent::Message(message));
    }

    fn on_socket_error(&mut self, socket: u64, error: String) {
        if !self.is_current(socket) {
            return;
        }
        tracing::warn!(error = %error, "Socket error");
        if let Some(current) = self.socket.as_mut() {
            current.last_error = Some(error);
        }
    }

    fn on_socket_closed(&mut self, socket: u64, code: u16, error: Option<String>) {
        if self.is_closed() || !self.is_current(socket) {
            return;
        }

        let Some(mut closed) = self.socket.take() else {
            return;
        };
        let reason = error
            .or_else(|| closed.last_error.take())
            .unwrap_or_else(|| format!("connection closed with code {}", code));
        let attempt = closed.attempt;
        let was_open = closed.opened;
        drop(closed);

        if code == SERVER_CLOSE_CODE {
            tracing::info!(code, "Server ended the session");
            self.terminate(Some(code));
            return;
        }

        if !was_open {
            tracing::warn!(attempt, code, error = %reason, "Connect attempt failed");
            self.events.safe_emit(&TransportEvent::Failed { attempt });

            if self.is_closed() {
                return;
            }

            let retried = self
                .operation
                .as_ref()
                .is_some_and(|operation| operation.retry(Error::WebSocket(reason)));
            if !retried {
                tracing::warn!(attempt, "Giving up reconnecting");
                self.terminate(Some(code));
            }
            return;
        }

        if let Some(operation) = self.operation.take() {
            operation.stop();
        }
        self.state.set(ConnectionState::Disconnected);
        tracing::info!(code, "Transport disconnected");
        self.events.safe_emit(&TransportEvent::Disconnected);

        if !self.is_closed() {
            self.start_cycle();
        }
    }

    async fn write(&mut self, payload: String) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let sink = self
            .socket
            .as_mut()
            .and_then(|socket| socket.sink.as_mut())
            .ok_or(Error::NotConnected)?;

        sink.send(WsMessage::Text(payload))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.terminated {
            return;
        }

        if let Some(mut socket) = self.socket.take() {
            for task in socket.tasks.drain(..) {
                task.abort();
            }

            if let Some(mut sink) = socket.sink.take() {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let flush = async {
                    sink.send(WsMessage::Close(Some(frame))).await?;
                    sink.close().await
                };
                if let Ok(Err(e)) = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
                    tracing::debug!(error = %e, "Close frame not delivered");
                }
            }
        }

        self.terminate(None);
    }

    fn terminate(&mut self, code: Option<u16>) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.closed.store(true, Ordering::SeqCst);

        let cause = self.operation.take().and_then(|operation| {
            operation.stop();
            operation.main_error()
        });
        self.socket = None;

        self.state.set(ConnectionState::Closed);
        tracing::info!(code = ?code, cause = ?cause, "Transport closed");
        self.events.safe_emit(&TransportEvent::Close { code, cause });
    }
}

async fn read_socket(socket: u64, mut stream: SplitStream<WsStream>, commands: WeakCommandTx) {
    let mut code = ABNORMAL_CLOSURE_CODE;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => post(&commands, Command::Frame { socket, text }),
            Ok(WsMessage::Close(frame)) => {
                code = frame.map_or(NO_STATUS_CODE, |frame| u16::from(frame.code));
                break;
            }
            Ok(WsMessage::Binary(data)) => {
                tracing::debug!(len = data.len(), "Ignoring binary frame");
            }
            Ok(_) => {}
            Err(e) => {
                post(
                    &commands,
                    Command::SocketError {
                        socket,
                        error: e.to_string(),
                    },
                );
                break;
            }
        }
    }

    post(&commands, Command::SocketClosed { socket, code });
}
