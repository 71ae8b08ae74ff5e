//! Offline operation queue model.
//!
//! Work that could not reach the remote service waits here, strictly in
//! submission order. This module holds the ordering rules and the persisted
//! format; writing it to durable storage and draining it over the network is
//! the client runtime's job.

use crate::{error::Result, Error, IdempotencyKey, Mutation, OperationId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Version of the persisted queue format.
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// The work a queued entry stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    /// Re-fetch a whole table and replace its mirror
    SyncTable { table: TableName },
    /// Send a mutation submitted by UI code
    PushRecord { mutation: Mutation },
    /// Send a mutation produced by a derivation rule
    #[serde(rename_all = "camelCase")]
    DeriveMutation {
        idempotency_key: IdempotencyKey,
        mutation: Mutation,
    },
}

impl Operation {
    /// The table this operation writes to or reads from.
    pub fn table(&self) -> &TableName {
        match self {
            Operation::SyncTable { table } => table,
            Operation::PushRecord { mutation } => &mutation.table,
            Operation::DeriveMutation { mutation, .. } => &mutation.table,
        }
    }

    /// The mutation carried, if this operation sends one.
    pub fn mutation(&self) -> Option<&Mutation> {
        match self {
            Operation::SyncTable { .. } => None,
            Operation::PushRecord { mutation } => Some(mutation),
            Operation::DeriveMutation { mutation, .. } => Some(mutation),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::SyncTable { .. } => "syncTable",
            Operation::PushRecord { .. } => "pushRecord",
            Operation::DeriveMutation { .. } => "deriveMutation",
        }
    }
}

/// An operation waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Unique identifier for this entry
    pub id: OperationId,
    /// What to do
    pub operation: Operation,
    /// When it was queued (milliseconds since epoch)
    pub enqueued_at: Timestamp,
}

impl QueuedOperation {
    /// Create a new queued operation.
    pub fn new(id: impl Into<OperationId>, operation: Operation, enqueued_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            operation,
            enqueued_at,
        }
    }
}

/// FIFO of queued operations.
///
/// Entries leave the queue only through [`OperationQueue::acknowledge`], which
/// requires the id of the entry at the front. There is no way to skip an
/// entry, so replay order always equals submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationQueue {
    format_version: u32,
    operations: VecDeque<QueuedOperation>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            format_version: QUEUE_FORMAT_VERSION,
            operations: VecDeque::new(),
        }
    }

    /// Append an operation at the back.
    ///
    /// An entry with an id already in the queue is ignored and `false` is
    /// returned, so a retried enqueue cannot duplicate work.
    pub fn push(&mut self, op: QueuedOperation) -> bool {
        if self.contains(&op.id) {
            return false;
        }
        self.operations.push_back(op);
        true
    }

    /// The next operation to send.
    pub fn front(&self) -> Option<&QueuedOperation> {
        self.operations.front()
    }

    /// Remove the front entry after its send was confirmed.
    ///
    /// Returns the removed entry, or `None` if `id` is not at the front.
    pub fn acknowledge(&mut self, id: &str) -> Option<QueuedOperation> {
        if self.operations.front().map(|op| op.id.as_str()) == Some(id) {
            self.operations.pop_front()
        } else {
            None
        }
    }

    /// Put an entry back at the front, undoing an acknowledge.
    pub fn restore_front(&mut self, op: QueuedOperation) {
        if !self.contains(&op.id) {
            self.operations.push_front(op);
        }
    }

    /// Check whether an entry with `id` is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.operations.iter().any(|op| op.id == id)
    }

    /// Iterate entries in replay order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.operations.iter()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Serialize for durable storage.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from durable storage.
    pub fn from_json(json: &str) -> Result<Self> {
        let queue: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if queue.format_version > QUEUE_FORMAT_VERSION {
            return Err(Error::UnsupportedFormat {
                found: queue.format_version,
                supported: QUEUE_FORMAT_VERSION,
            });
        }

        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_op(id: &str, n: i64) -> QueuedOperation {
        QueuedOperation::new(
            id,
            Operation::PushRecord {
                mutation: Mutation::insert("sales", json!({"total": n})),
            },
            1000 + n as u64,
        )
    }

    #[test]
    fn fifo_order() {
        let mut queue = OperationQueue::new();
        queue.push(push_op("a", 1));
        queue.push(push_op("b", 2));
        queue.push(push_op("c", 3));

        let ids: Vec<_> = queue.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(queue.front().unwrap().id, "a");
    }

    #[test]
    fn duplicate_id_is_ignored() {
        let mut queue = OperationQueue::new();
        assert!(queue.push(push_op("a", 1)));
        assert!(!queue.push(push_op("a", 1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn acknowledge_only_front() {
        let mut queue = OperationQueue::new();
        queue.push(push_op("a", 1));
        queue.push(push_op("b", 2));

        assert!(queue.acknowledge("b").is_none());
        assert_eq!(queue.len(), 2);

        let removed = queue.acknowledge("a").unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(queue.front().unwrap().id, "b");
    }

    #[test]
    fn restore_front_undoes_acknowledge() {
        let mut queue = OperationQueue::new();
        queue.push(push_op("a", 1));
        queue.push(push_op("b", 2));

        let a = queue.acknowledge("a").unwrap();
        queue.restore_front(a);

        let ids: Vec<_> = queue.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn operation_accessors() {
        let sync = Operation::SyncTable {
            table: "stock".into(),
        };
        assert_eq!(sync.table(), "stock");
        assert!(sync.mutation().is_none());
        assert_eq!(sync.name(), "syncTable");

        let derived = Operation::DeriveMutation {
            idempotency_key: "k".into(),
            mutation: Mutation::upsert("cash_movements", json!({"id": "sale-1"})),
        };
        assert_eq!(derived.table(), "cash_movements");
        assert!(derived.mutation().is_some());
        assert_eq!(derived.name(), "deriveMutation");
    }

    #[test]
    fn serialization_format() {
        let op = QueuedOperation::new(
            "op-1",
            Operation::DeriveMutation {
                idempotency_key: "sale_cash_movement:1".into(),
                mutation: Mutation::upsert("cash_movements", json!({"id": "sale-1"})),
            },
            5,
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"]["type"], "deriveMutation");
        assert_eq!(json["operation"]["idempotencyKey"], "sale_cash_movement:1");
        assert_eq!(json["enqueuedAt"], 5);
    }

    #[test]
    fn json_roundtrip() {
        let mut queue = OperationQueue::new();
        queue.push(push_op("a", 1));
        queue.push(QueuedOperation::new(
            "b",
            Operation::SyncTable {
                table: "stock".into(),
            },
            2,
        ));

        let json = queue.to_json().unwrap();
        let parsed = OperationQueue::from_json(&json).unwrap();
        assert_eq!(queue, parsed);
    }

    #[test]
    fn newer_format_is_rejected() {
        let json = r#"{"formatVersion": 99, "operations": []}"#;
        assert!(matches!(
            OperationQueue::from_json(json),
            Err(Error::UnsupportedFormat { found: 99, .. })
        ));
    }
}
