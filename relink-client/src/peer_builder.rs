//! Peer builder for configuring the transport, retries and observability
//!
//! The `PeerBuilder` provides a fluent API for everything a [`Peer`] needs
//! before its transport starts connecting:
//! - sub-protocol, backoff and retry options of the transport
//! - request timeout and wait-for-connection behaviour of the peer
//! - OpenTelemetry observability and the service name used for it
//!
//! # Examples
//!
//! ```rust,no_run
//! use relink_client::{BackoffConfig, PeerBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> relink_core::Result<()> {
//! // Start connecting in the background
//! let peer = PeerBuilder::new("ws://localhost:4443")
//!     .backoff(BackoffConfig::default().with_retries(5).with_randomize(true))
//!     .request_timeout(Duration::from_secs(10))
//!     .wait_for_connection(true)
//!     .build()?;
//!
//! // Or wait for the first socket, with observability
//! let peer2 = PeerBuilder::new("ws://localhost:4443")
//!     .with_default_observability()
//!     .service_name("room-client")
//!     .connect()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::backoff::Backoff;
use crate::metrics::PeerMetrics;
use crate::peer::{Peer, PeerOptions};
use crate::retry::RetryOptions;
use crate::transport::{Transport, TransportOptions};
use relink_core::{Error, ObservabilityConfig, Result};
use std::sync::Arc;
use std::time::Duration;

/// Builder for configuring and creating a [`Peer`]
#[derive(Debug, Clone)]
pub struct PeerBuilder {
    url: String,
    transport: TransportOptions,
    peer: PeerOptions,
    observability_config: Option<ObservabilityConfig>,
    service_name: Option<String>,
}

impl PeerBuilder {
    /// Create a new peer builder
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: TransportOptions::default(),
            peer: PeerOptions::default(),
            observability_config: None,
            service_name: None,
        }
    }

    /// Request a WebSocket sub-protocol
    pub fn sub_protocol(mut self, sub_protocol: impl Into<String>) -> Self {
        self.transport.sub_protocol = Some(sub_protocol.into());
        self
    }

    /// Set the reconnection backoff policy
    pub fn backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.transport.backoff = backoff.into();
        self
    }

    /// Set the retry operation options
    pub fn retry_options(mut self, retry: RetryOptions) -> Self {
        self.transport.retry = retry;
        self
    }

    /// Fail a connect attempt that has not opened within `timeout`
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport.connect_timeout = Some(timeout);
        self
    }

    /// Set the default request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.peer.request_timeout = timeout;
        self
    }

    /// Wait for the connection instead of failing requests while
    /// disconnected
    pub fn wait_for_connection(mut self, wait: bool) -> Self {
        self.peer.wait_for_connection = wait;
        self
    }

    /// Limit the listeners per peer event kind
    pub fn max_listeners(mut self, max: usize) -> Self {
        self.peer.max_listeners = Some(max);
        self
    }

    /// Enable OpenTelemetry observability with custom configuration
    pub fn with_observability(mut self, config: ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(ObservabilityConfig::default());
        self
    }

    /// Set service name for observability (used if observability is enabled)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// The configured transport options
    pub fn transport_options(&self) -> &TransportOptions {
        &self.transport
    }

    /// The configured peer options
    pub fn peer_options(&self) -> &PeerOptions {
        &self.peer
    }

    /// Build the peer and start connecting in the background
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an invalid backoff or URL, `Error::Internal` if
    /// observability cannot be initialized.
    pub fn build(self) -> Result<Peer> {
        let metrics = match self.observability_config {
            Some(mut config) => {
                if let Some(name) = self.service_name {
                    config.service_name = name;
                }

                relink_core::init_observability(config.clone()).map_err(|e| {
                    Error::Internal(format!("Failed to initialize observability: {}", e))
                })?;

                Some(Arc::new(PeerMetrics::new(config.service_name)))
            }
            None => None,
        };

        tracing::info!(url = %self.url, "Creating peer");
        let transport = Transport::new(self.url, self.transport)?;
        Peer::with_metrics(transport, self.peer, metrics)
    }

    /// Build the peer and wait for its first socket
    ///
    /// Waits at most the request timeout. On failure the peer is closed and
    /// the error returned.
    pub async fn connect(self) -> Result<Peer> {
        let timeout = self.peer.request_timeout;
        let peer = self.build()?;

        if let Err(e) = peer.wait_until_open(timeout).await {
            peer.close().await;
            return Err(e);
        }

        Ok(peer)
    }
}
