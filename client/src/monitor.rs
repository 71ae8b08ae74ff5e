//! Connection monitor.
//!
//! Owns the one [`ConnectionState`] of an engine. Other components read it
//! through [`ConnectionMonitor::status`] or a watch receiver; only signals fed
//! to [`ConnectionMonitor::signal`] change it. Every change is broadcast as a
//! `connection` listener event carrying the serialized state.

use std::sync::Arc;

use tillsync_engine::{ConnectionSignal, ConnectionState, Transition};
use tokio::sync::watch;

use crate::dispatcher::Dispatcher;

/// Listener event emitted on every connection state change.
pub const CONNECTION_EVENT: &str = "connection";

/// Tracks transport health and platform connectivity.
#[derive(Debug)]
pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionState>,
    dispatcher: Arc<Dispatcher>,
}

impl ConnectionMonitor {
    /// Create a monitor in the initial disconnected state.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let (state, _) = watch::channel(ConnectionState::initial(crate::now_ms()));
        Self { state, dispatcher }
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Whether the platform reports network connectivity.
    pub fn is_online(&self) -> bool {
        self.state.borrow().network_online
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Feed a signal. Returns the transition if the state changed.
    pub fn signal(&self, signal: ConnectionSignal) -> Option<Transition> {
        let now = crate::now_ms();
        let mut transition = None;

        self.state.send_if_modified(|state| {
            transition = state.apply(signal, now);
            transition.is_some()
        });

        if let Some(t) = transition {
            let state = self.status();
            tracing::info!(
                from = %t.previous,
                to = %t.current,
                attempts = state.reconnect_attempts,
                "Connection state changed"
            );

            match serde_json::to_value(&state) {
                Ok(payload) => {
                    self.dispatcher.notify(CONNECTION_EVENT, &payload);
                }
                Err(e) => tracing::error!("Failed to serialize connection state: {}", e),
            }
        }

        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tillsync_engine::ConnectionStatus;

    #[test]
    fn emits_connection_events_on_change_only() {
        let dispatcher = Dispatcher::new_shared();
        let monitor = ConnectionMonitor::new(dispatcher.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.add_listener(CONNECTION_EVENT, move |payload| {
            sink.lock()
                .unwrap()
                .push(payload["status"].as_str().unwrap_or_default().to_string());
            Ok(())
        });

        monitor.signal(ConnectionSignal::AttemptStarted);
        monitor.signal(ConnectionSignal::TransportOpened);
        monitor.signal(ConnectionSignal::TransportOpened);
        monitor.signal(ConnectionSignal::TransportClosed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["connecting", "connected", "disconnected"]
        );
    }

    #[tokio::test]
    async fn watchers_observe_changes() {
        let monitor = ConnectionMonitor::new(Dispatcher::new_shared());
        let mut rx = monitor.watch();

        monitor.signal(ConnectionSignal::TransportOpened);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, ConnectionStatus::Connected);
        assert!(monitor.is_connected());
    }

    #[test]
    fn offline_is_tracked() {
        let monitor = ConnectionMonitor::new(Dispatcher::new_shared());
        assert!(monitor.is_online());
        monitor.signal(ConnectionSignal::NetworkOffline);
        assert!(!monitor.is_online());
    }
}
