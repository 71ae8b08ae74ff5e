//! Listener dispatcher.
//!
//! UI-facing code registers callbacks by event name and never touches the
//! transport. Each callback runs in isolation: an `Err` or a panic from one
//! listener is logged and the remaining listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

/// Error a listener may return.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl From<&str> for ListenerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for ListenerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// A registered callback.
pub type Listener = Arc<dyn Fn(&Value) -> Result<(), ListenerError> + Send + Sync>;

/// Fans named events out to registered listeners.
#[derive(Default)]
pub struct Dispatcher {
    listeners: DashMap<String, Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("events", &self.listeners.len())
            .finish()
    }
}

impl Dispatcher {
    /// Create a new dispatcher wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback for `event`.
    ///
    /// The returned handle removes exactly this callback.
    pub fn add_listener<F>(self: &Arc<Self>, event: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let event = event.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.listeners
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        tracing::debug!(event = %event, listener = id, "Listener registered");

        ListenerHandle {
            dispatcher: Arc::downgrade(self),
            event,
            id,
        }
    }

    fn remove(&self, event: &str, id: u64) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.listeners.get_mut(event) {
            let before = entry.len();
            entry.retain(|(lid, _)| *lid != id);
            removed = entry.len() != before;
            if entry.is_empty() {
                drop(entry);
                self.listeners.remove_if(event, |_, v| v.is_empty());
            }
        }
        removed
    }

    /// Invoke every listener registered for `event`.
    ///
    /// Listeners added or removed while this runs do not affect this call.
    /// Returns the number of listeners that completed without error.
    pub fn notify(&self, event: &str, payload: &Value) -> usize {
        let listeners: Vec<(u64, Listener)> = match self.listeners.get(event) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(event = %event, listener = id, error = %e, "Listener failed");
                }
                Err(_) => {
                    tracing::warn!(event = %event, listener = id, "Listener panicked");
                }
            }
        }
        delivered
    }

    /// Number of listeners for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entry| entry.len())
    }
}

/// Removes one registered listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    dispatcher: Weak<Dispatcher>,
    event: String,
    id: u64,
}

impl ListenerHandle {
    /// The event this listener is registered for.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the listener. Returns `false` if it was already removed.
    pub fn remove(&self) -> bool {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.remove(&self.event, self.id),
            None => false,
        }
    }
}
