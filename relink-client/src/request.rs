//! Pending request tracking
//!
//! Every outbound request is registered under its correlation id together
//! with a oneshot sender. The entry is removed exactly once, by whichever
//! comes first:
//!
//! 1. **Response**: a matching success or error envelope arrives
//! 2. **Timeout**: the caller's timer elapses
//! 3. **Close**: the peer closes and fails every entry
//!
//! Removal from the map is the arbitration point: only the party that
//! removes the entry completes it, so a late response for an entry already
//! removed by a timeout finds nothing and is ignored.

use relink_core::message::generate_request_id;
use relink_core::{Error, RequestId, Response, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Outcome delivered to a waiting request
pub type Completion = Result<Value>;

/// Pending request waiting for a response
pub struct PendingRequest {
    /// Method name, kept for logging
    pub method: String,
    /// Channel completing the request
    pub tx: oneshot::Sender<Completion>,
}

/// Manager for tracking pending requests
#[derive(Clone, Default)]
pub struct RequestManager {
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
}

impl RequestManager {
    /// Create a new request manager
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pending request under a fresh id
    ///
    /// `preferred` is used when it is free; otherwise random ids are drawn
    /// until one is.
    pub fn register(
        &self,
        preferred: RequestId,
        method: impl Into<String>,
    ) -> (RequestId, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();

        let mut id = preferred;
        while pending.contains_key(&id) {
            id = generate_request_id();
        }

        pending.insert(
            id,
            PendingRequest {
                method: method.into(),
                tx,
            },
        );
        (id, rx)
    }

    /// Complete a pending request with a response
    ///
    /// Returns the method of the completed request, or `None` when no entry
    /// matched the response id.
    pub fn complete(&self, response: Response) -> Option<String> {
        let entry = self.lock().remove(&response.id())?;

        let outcome = match response {
            Response::Success { data, .. } => Ok(data),
            Response::Error {
                error_code,
                error_reason,
                ..
            } => Err(Error::Remote {
                code: error_code,
                reason: error_reason,
            }),
        };

        let _ = entry.tx.send(outcome);
        Some(entry.method)
    }

    /// Remove a pending request without completing it
    pub fn remove(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail all pending requests
    pub fn fail_all(&self, error: Error) {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    /// Whether a request with `id` is pending
    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Get the number of pending requests
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}
