//! Channel subscription registry.
//!
//! One [`ChannelSubscription`] per watched table. The registry remembers what
//! was subscribed so it can re-issue everything after a reconnect, and turns
//! raw provider notifications into [`DomainEvent`]s.
//!
//! Accepted notification shape:
//!
//! ```json
//! {
//!   "table": "sales",
//!   "eventType": "INSERT",
//!   "new": { "id": "sale-42", "total": 19.5 },
//!   "old": null,
//!   "commitTimestamp": "2024-05-01T10:00:00Z",
//!   "seq": 7
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tillsync_engine::{
    Catalog, DomainEvent, Error as EngineError, EventKind, EventStamp, TableName, Timestamp,
};

use crate::transport::RealtimeTransport;

/// Predicate deciding whether an entity is of interest.
pub type EntityFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A standing registration for change notifications on one table.
#[derive(Clone)]
pub struct ChannelSubscription {
    pub table: TableName,
    pub kinds: BTreeSet<EventKind>,
    pub filter: Option<EntityFilter>,
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("table", &self.table)
            .field("kinds", &self.kinds)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl ChannelSubscription {
    /// Subscription to the given kinds of change on `table`.
    pub fn new(table: impl Into<TableName>, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self {
            table: table.into(),
            kinds: kinds.into_iter().collect(),
            filter: None,
        }
    }

    /// Subscription to every kind of change on `table`.
    pub fn all(table: impl Into<TableName>) -> Self {
        Self::new(table, EventKind::ALL)
    }

    /// Builder-style method to only accept entities matching `filter`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Whether an event passes this subscription.
    pub fn accepts(&self, event: &DomainEvent) -> bool {
        self.kinds.contains(&event.kind) && self.filter.as_ref().map_or(true, |f| f(&event.entity))
    }

    fn kind_list(&self) -> Vec<EventKind> {
        self.kinds.iter().copied().collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNotification {
    table: String,
    event_type: String,
    #[serde(default)]
    new: Option<Value>,
    #[serde(default)]
    old: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<Value>,
    #[serde(default)]
    seq: Option<u64>,
}

/// Parse a timestamp given as epoch milliseconds or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok()),
        _ => None,
    }
}

/// Registry of active subscriptions.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    subscriptions: DashMap<TableName, ChannelSubscription>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription, replacing any previous one for the same table.
    pub fn register(&self, subscription: ChannelSubscription) {
        tracing::debug!(table = %subscription.table, "Subscription registered");
        self.subscriptions
            .insert(subscription.table.clone(), subscription);
    }

    /// Get the subscription for a table.
    pub fn get(&self, table: &str) -> Option<ChannelSubscription> {
        self.subscriptions.get(table).map(|s| s.value().clone())
    }

    /// Subscribed table names, sorted.
    pub fn tables(&self) -> Vec<TableName> {
        let mut tables: Vec<_> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        tables.sort();
        tables
    }

    /// Number of subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Issue one subscription on the transport.
    pub async fn activate(
        &self,
        transport: &dyn RealtimeTransport,
        table: &str,
    ) -> Result<(), crate::transport::TransportError> {
        let kinds = match self.get(table) {
            Some(sub) => sub.kind_list(),
            None => return Ok(()),
        };
        transport.subscribe(table, &kinds).await
    }

    /// Re-issue every registered subscription, in table order.
    ///
    /// Stops at the first failure; the caller treats it as a lost connection.
    pub async fn resubscribe_all(
        &self,
        transport: &dyn RealtimeTransport,
    ) -> Result<usize, crate::transport::TransportError> {
        let tables = self.tables();
        for table in &tables {
            self.activate(transport, table).await?;
        }
        tracing::info!(count = tables.len(), "Subscriptions issued");
        Ok(tables.len())
    }

    /// Tear down every subscription. Never fails.
    pub async fn unsubscribe_all(&self, transport: &dyn RealtimeTransport) {
        for table in self.tables() {
            if let Err(e) = transport.unsubscribe(&table).await {
                tracing::debug!(table = %table, error = %e, "Unsubscribe failed, ignoring");
            }
        }
        self.subscriptions.clear();
    }

    /// Turn a raw notification into a domain event.
    ///
    /// `Ok(None)` means the notification is valid but not wanted (table not
    /// subscribed, kind not watched, or filtered out).
    pub fn normalize(
        &self,
        catalog: &Catalog,
        raw: &Value,
    ) -> Result<Option<DomainEvent>, EngineError> {
        let raw: RawNotification = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::InvalidPayload(format!("malformed notification: {}", e)))?;

        let spec = catalog.require(&raw.table)?;
        let subscription = match self.get(&raw.table) {
            Some(sub) => sub,
            None => return Ok(None),
        };

        let kind = EventKind::parse(&raw.event_type).ok_or_else(|| {
            EngineError::InvalidPayload(format!("unknown event type '{}'", raw.event_type))
        })?;

        let not_null = |v: Option<Value>| v.filter(|v| !v.is_null());
        let (entity, previous) = match kind {
            EventKind::Delete => {
                let entity = not_null(raw.old)
                    .or_else(|| not_null(raw.new))
                    .ok_or_else(|| EngineError::InvalidPayload("delete without entity".into()))?;
                (entity, None)
            }
            EventKind::Insert | EventKind::Update => {
                let entity = not_null(raw.new)
                    .ok_or_else(|| EngineError::InvalidPayload("change without entity".into()))?;
                (entity, not_null(raw.old))
            }
        };

        if !entity.is_object() {
            return Err(EngineError::InvalidPayload("entity must be an object".into()));
        }
        spec.entity_id(&entity)?;

        let occurred_at = raw
            .commit_timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .or_else(|| spec.entity_timestamp(&entity).and_then(parse_timestamp))
            .ok_or_else(|| {
                EngineError::InvalidPayload(format!(
                    "no usable timestamp for change on '{}'",
                    raw.table
                ))
            })?;

        let mut event = DomainEvent::new(
            raw.table,
            kind,
            entity,
            EventStamp::with_seq(occurred_at, raw.seq.unwrap_or(0)),
        );
        if let Some(previous) = previous {
            event = event.with_previous(previous);
        }

        if !subscription.accepts(&event) {
            return Ok(None);
        }
        Ok(Some(event))
    }
}
