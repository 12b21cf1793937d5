//! Event registry shared by the transport and the peer
//!
//! An [`EventEmitter`] maps an event kind to an ordered list of synchronous
//! listeners. Events are plain enums implementing [`Event`]; the kind is the
//! fieldless discriminant used as registry key.
//!
//! Listeners run on the emitting task, in registration order, with the
//! registry lock released, so a listener may register or remove listeners
//! (including itself) without deadlocking.
//!
//! [`safe_emit`](EventEmitter::safe_emit) isolates listener panics: a
//! panicking listener is logged and the remaining listeners still run.
//!
//! # Examples
//!
//! ```rust
//! use relink_client::events::{Event, EventEmitter};
//!
//! #[derive(Debug)]
//! enum Door { Opened, Closed(u32) }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum DoorKind { Opened, Closed }
//!
//! impl Event for Door {
//!     type Kind = DoorKind;
//!     fn kind(&self) -> DoorKind {
//!         match self {
//!             Door::Opened => DoorKind::Opened,
//!             Door::Closed(_) => DoorKind::Closed,
//!         }
//!     }
//! }
//!
//! let emitter = EventEmitter::<Door>::new();
//! emitter.on(DoorKind::Closed, |event| println!("{:?}", event)).unwrap();
//! emitter.safe_emit(&Door::Closed(3));
//! ```

use relink_core::{Error, Result};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// An event that can be dispatched by an [`EventEmitter`]
pub trait Event {
    /// Registry key identifying the event variant
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// The kind of this event
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventEmitter::on`], used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E: Event> {
    listeners: HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>,
    max_listeners: usize,
}

/// Registry of synchronous listeners keyed by event kind
///
/// Cloning yields another handle to the same registry.
pub struct EventEmitter<E: Event> {
    registry: Arc<Mutex<Registry<E>>>,
    next_id: Arc<AtomicU64>,
}

impl<E: Event> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E: Event> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventEmitter<E> {
    /// Create an emitter without a listener limit
    pub fn new() -> Self {
        Self::with_max_listeners(usize::MAX)
    }

    /// Create an emitter allowing at most `max` listeners per kind
    pub fn with_max_listeners(max: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                listeners: HashMap::new(),
                max_listeners: max,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Change the per-kind listener limit
    ///
    /// Listeners already registered are kept even above the new limit.
    pub fn set_max_listeners(&self, max: usize) {
        self.lock().max_listeners = max;
    }

    /// The per-kind listener limit
    pub fn max_listeners(&self) -> usize {
        self.lock().max_listeners
    }

    /// Register a listener for `kind`
    ///
    /// # Errors
    ///
    /// Returns `Error::MaxListeners` if `kind` already has the maximum
    /// number of listeners.
    pub fn on<F>(&self, kind: E::Kind, listener: F) -> Result<ListenerId>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let max = registry.max_listeners;
        let listeners = registry.listeners.entry(kind).or_default();

        if listeners.len() >= max {
            return Err(Error::MaxListeners {
                event: format!("{:?}", kind),
                max,
            });
        }

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    /// Remove a listener; returns whether it was registered
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut registry = self.lock();
        let Some(listeners) = registry.listeners.get_mut(&kind) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            registry.listeners.remove(&kind);
        }
        removed
    }

    /// Remove every listener of `kind`
    pub fn remove_all_listeners(&self, kind: E::Kind) {
        self.lock().listeners.remove(&kind);
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.lock().listeners.get(&kind).map_or(0, Vec::len)
    }

    fn snapshot(&self, kind: E::Kind) -> Vec<Listener<E>> {
        self.lock()
            .listeners
            .get(&kind)
            .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Invoke every listener of the event's kind
    ///
    /// A panicking listener propagates the panic to the caller.
    pub fn emit(&self, event: &E) {
        for listener in self.snapshot(event.kind()) {
            listener(event);
        }
    }

    /// Invoke every listener of the event's kind, catching panics
    ///
    /// Returns the number of listeners that panicked.
    pub fn safe_emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let mut panicked = 0;

        for listener in self.snapshot(kind) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                panicked += 1;
                tracing::error!(
                    event = ?kind,
                    error = %panic_message(&*panic),
                    "Event listener panicked"
                );
            }
        }

        panicked
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
