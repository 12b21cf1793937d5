//! Peer metrics definitions
//!
//! OpenTelemetry instruments describing the health of a peer and its
//! transport. They are created by [`PeerBuilder`](crate::PeerBuilder) when
//! observability is configured, and exported by whatever meter provider
//! [`relink_core::init_observability`] installed.
//!
//! # Metrics Collected
//!
//! - **connection.state**: current connection state (gauge)
//! - **requests.total** / **request.duration**: outbound requests by method
//!   and status
//! - **errors.total**: errors by type
//! - **connect.failures**: attempts that never opened
//! - **disconnects**: open sockets that were lost
//! - **notifications.received** / **requests.received**: inbound traffic

use crate::connection_state::ConnectionState;
use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, Meter},
    KeyValue,
};

/// Peer metrics for monitoring
pub struct PeerMetrics {
    /// Connection state (0=connecting, 1=open, 2=disconnected, 3=closed)
    pub connection_state: Gauge<i64>,
    /// Total number of requests sent
    pub requests_total: Counter<u64>,
    /// Request duration in seconds
    pub request_duration: Histogram<f64>,
    /// Total number of errors
    pub errors_total: Counter<u64>,
    /// Connect attempts that failed before opening
    pub connect_failures: Counter<u64>,
    /// Open connections that were lost
    pub disconnects: Counter<u64>,
    /// Notifications received from the remote side
    pub notifications_received: Counter<u64>,
    /// Requests received from the remote side
    pub requests_received: Counter<u64>,
}

impl PeerMetrics {
    /// Create metrics on the global meter named after the service
    pub fn new(service_name: impl Into<String>) -> Self {
        let name: &'static str = Box::leak(service_name.into().into_boxed_str());
        let meter = global::meter(name);
        Self::new_with_meter(&meter)
    }

    /// Create metrics on a custom meter
    pub fn new_with_meter(meter: &Meter) -> Self {
        Self {
            connection_state: meter
                .i64_gauge("relink.peer.connection.state")
                .with_description("Connection state (0=connecting, 1=open, 2=disconnected, 3=closed)")
                .build(),
            requests_total: meter
                .u64_counter("relink.peer.requests.total")
                .with_description("Total number of requests sent")
                .build(),
            request_duration: meter
                .f64_histogram("relink.peer.request.duration")
                .with_description("Request duration in seconds")
                .build(),
            errors_total: meter
                .u64_counter("relink.peer.errors.total")
                .with_description("Total number of errors encountered")
                .build(),
            connect_failures: meter
                .u64_counter("relink.peer.connect.failures")
                .with_description("Connect attempts that failed before opening")
                .build(),
            disconnects: meter
                .u64_counter("relink.peer.disconnects")
                .with_description("Open connections that were lost")
                .build(),
            notifications_received: meter
                .u64_counter("relink.peer.notifications.received")
                .with_description("Total number of notifications received")
                .build(),
            requests_received: meter
                .u64_counter("relink.peer.requests.received")
                .with_description("Total number of requests received")
                .build(),
        }
    }

    /// Update connection state
    pub fn update_connection_state(&self, state: ConnectionState) {
        self.connection_state.record(state.as_gauge(), &[]);
    }

    /// Record a completed request
    pub fn record_request(&self, method: &str, status: &str, duration_secs: f64) {
        let attributes = &[
            KeyValue::new("method", method.to_string()),
            KeyValue::new("status", status.to_string()),
        ];
        self.requests_total.add(1, attributes);
        self.request_duration.record(duration_secs, attributes);
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        let attributes = &[KeyValue::new("error_type", error_type.to_string())];
        self.errors_total.add(1, attributes);
    }

    /// Record a failed connect attempt
    pub fn record_connect_failure(&self, attempt: u32) {
        self.connect_failures
            .add(1, &[KeyValue::new("attempt", i64::from(attempt))]);
    }

    /// Record a lost connection
    pub fn record_disconnect(&self) {
        self.disconnects.add(1, &[]);
    }

    /// Record an inbound notification
    pub fn record_notification(&self, method: &str) {
        let attributes = &[KeyValue::new("method", method.to_string())];
        self.notifications_received.add(1, attributes);
    }

    /// Record an inbound request
    pub fn record_inbound_request(&self, method: &str) {
        let attributes = &[KeyValue::new("method", method.to_string())];
        self.requests_received.add(1, attributes);
    }
}
