//! Normalized domain events.
//!
//! Whatever shape a change notification had on the wire, by the time it
//! reaches the mirror store, the listeners or the deriver it is a
//! [`DomainEvent`].

use crate::{EventStamp, TableName, TableSpec, Timestamp};
use serde::{Deserialize, Serialize};

/// The kind of change a domain event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// All kinds, in a stable order.
    pub const ALL: [EventKind; 3] = [EventKind::Insert, EventKind::Update, EventKind::Delete];

    /// Parse a provider event type (`INSERT`, `update`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "insert" => Some(EventKind::Insert),
            "update" => Some(EventKind::Update),
            "delete" => Some(EventKind::Delete),
            _ => None,
        }
    }

    /// The listener event name for this kind of change to `entity`.
    ///
    /// `sale` becomes `new_sale`, `sale_updated` or `sale_deleted`.
    pub fn listener_event(&self, entity: &str) -> String {
        match self {
            EventKind::Insert => format!("new_{}", entity),
            EventKind::Update => format!("{}_updated", entity),
            EventKind::Delete => format!("{}_deleted", entity),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Insert => write!(f, "insert"),
            EventKind::Update => write!(f, "update"),
            EventKind::Delete => write!(f, "delete"),
        }
    }
}

/// A normalized insert/update/delete notification for one entity.
///
/// Immutable once created. It is a transient notification, not state: the
/// mirror store keeps the state it implies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    /// Table the entity belongs to
    pub table: TableName,
    /// What happened
    pub kind: EventKind,
    /// The entity after the change (before it, for deletes)
    pub entity: serde_json::Value,
    /// The entity before the change, when the provider sends it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_entity: Option<serde_json::Value>,
    /// When the change happened
    pub stamp: EventStamp,
}

impl DomainEvent {
    /// Create a new event without a previous entity.
    pub fn new(
        table: impl Into<TableName>,
        kind: EventKind,
        entity: serde_json::Value,
        stamp: EventStamp,
    ) -> Self {
        Self {
            table: table.into(),
            kind,
            entity,
            previous_entity: None,
            stamp,
        }
    }

    /// Builder-style method to attach the previous entity.
    pub fn with_previous(mut self, previous: serde_json::Value) -> Self {
        self.previous_entity = Some(previous);
        self
    }

    /// When the change happened, in epoch milliseconds.
    pub fn occurred_at(&self) -> Timestamp {
        self.stamp.occurred_at
    }

    /// The listener event name for this event under `table`'s entity name.
    pub fn listener_event(&self, table: &TableSpec) -> String {
        self.kind.listener_event(&table.entity_name)
    }
}
