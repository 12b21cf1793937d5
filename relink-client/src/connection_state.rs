//! Connection state tracking
//!
//! The transport publishes its lifecycle through a [`ConnectionTracker`],
//! a thin wrapper over a `tokio::sync::watch` channel. Readers either
//! sample the current [`ConnectionState`] or wait for a transition.
//!
//! # State Transitions
//!
//! ```text
//! Connecting ──▶ Open ──▶ Disconnected ──▶ Open ...
//!     │            │            │
//!     └────────────┴────────────┴──▶ Closed
//! ```
//!
//! `Closed` is absorbing: once entered, no further transition is applied.

use relink_core::{Error, Result};
use std::time::Duration;
use tokio::sync::watch;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// First connect cycle in progress
    Connecting,
    /// A socket is open
    Open,
    /// The socket was lost, reconnecting
    Disconnected,
    /// Terminal, no further reconnection
    Closed,
}

impl ConnectionState {
    /// Numeric value recorded by the connection state gauge
    pub fn as_gauge(self) -> i64 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Open => 1,
            ConnectionState::Disconnected => 2,
            ConnectionState::Closed => 3,
        }
    }
}

/// Publisher and reader of a connection's state
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    /// Create a tracker in the `Connecting` state
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connecting);
        Self { tx }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Move to `state` unless already closed
    ///
    /// Returns whether the state changed.
    pub fn set(&self, state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        })
    }

    /// Whether a socket is open
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the connection is terminally closed
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state is `Open`
    ///
    /// # Errors
    ///
    /// - `Error::TransportClosed` if the state becomes `Closed` first
    /// - `Error::NotConnected` if `timeout` elapses first
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();

        let wait = async {
            let state = rx
                .wait_for(|state| matches!(state, ConnectionState::Open | ConnectionState::Closed))
                .await
                .map_err(|_| Error::TransportClosed)?;

            match *state {
                ConnectionState::Open => Ok(()),
                _ => Err(Error::TransportClosed),
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::NotConnected)?
    }
}
