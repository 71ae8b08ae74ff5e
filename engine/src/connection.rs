//! Connection lifecycle state machine and reconnect backoff.
//!
//! [`ConnectionState`] is the value every component reads to decide whether
//! to send directly or queue. It changes only through
//! [`ConnectionState::apply`], fed with [`ConnectionSignal`]s from the
//! transport and from the platform's online/offline notifications.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse health of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    /// The transport failed in a way that is not a plain disconnect
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Inputs that move the connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// The platform reports network connectivity
    NetworkOnline,
    /// The platform reports no network connectivity
    NetworkOffline,
    /// A connection attempt is starting
    AttemptStarted,
    /// The transport confirmed the connection
    TransportOpened,
    /// The transport closed
    TransportClosed,
    /// The transport failed; `fatal` marks failures that are not plain disconnects
    TransportFailed { message: String, fatal: bool },
}

/// A change of observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
}

impl Transition {
    /// True when this transition entered `connected`.
    pub fn entered_connected(&self) -> bool {
        self.current == ConnectionStatus::Connected && self.previous != ConnectionStatus::Connected
    }

    /// True when this transition left `connected`.
    pub fn left_connected(&self) -> bool {
        self.previous == ConnectionStatus::Connected && self.current != ConnectionStatus::Connected
    }
}

/// Snapshot of the realtime connection, as shown to UI code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Current status
    pub status: ConnectionStatus,
    /// Connection attempts since the last confirmed connect
    pub reconnect_attempts: u32,
    /// When the state last changed (milliseconds since epoch)
    pub last_change_at: Timestamp,
    /// Whether the platform reports network connectivity
    pub network_online: bool,
    /// Message of the last transport failure, cleared on connect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// The state before any connection attempt.
    pub fn initial(now: Timestamp) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_change_at: now,
            network_online: true,
            last_error: None,
        }
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Apply a signal.
    ///
    /// Returns the transition if the status or the attempt counter changed.
    pub fn apply(&mut self, signal: ConnectionSignal, now: Timestamp) -> Option<Transition> {
        let previous = self.status;
        let previous_attempts = self.reconnect_attempts;

        match signal {
            ConnectionSignal::NetworkOnline => {
                self.network_online = true;
            }
            ConnectionSignal::NetworkOffline => {
                self.network_online = false;
                self.status = ConnectionStatus::Disconnected;
            }
            ConnectionSignal::AttemptStarted => {
                if !self.network_online || self.status == ConnectionStatus::Connected {
                    return None;
                }
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                self.status = ConnectionStatus::Connecting;
            }
            ConnectionSignal::TransportOpened => {
                self.status = ConnectionStatus::Connected;
                self.reconnect_attempts = 0;
                self.last_error = None;
            }
            ConnectionSignal::TransportClosed => {
                if self.status != ConnectionStatus::Error {
                    self.status = ConnectionStatus::Disconnected;
                }
            }
            ConnectionSignal::TransportFailed { message, fatal } => {
                self.status = if fatal {
                    ConnectionStatus::Error
                } else {
                    ConnectionStatus::Disconnected
                };
                self.last_error = Some(message);
            }
        }

        if self.status == previous && self.reconnect_attempts == previous_attempts {
            return None;
        }

        self.last_change_at = now;
        Some(Transition {
            previous,
            current: self.status,
        })
    }
}

/// Reconnect backoff policy.
///
/// `delay(n) = min(base * 2^(n-1), max)`. The delay never decreases with `n`
/// and is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Delay after the first failed attempt, in milliseconds
    pub base_ms: u64,
    /// Upper bound for any delay, in milliseconds
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl Backoff {
    /// Create a policy. A zero base is raised to 1ms and `max` to at least `base`.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    /// How long to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }
}
