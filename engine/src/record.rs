//! Mirror records: the latest known snapshot of one entity.

use crate::{EntityId, EventStamp, TableName};
use serde::{Deserialize, Serialize};

/// The latest known state of one entity, keyed by `(table, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRecord {
    /// Unique identifier within the table
    pub id: EntityId,
    /// Table this record belongs to
    pub table: TableName,
    /// The entity as last seen
    pub entity: serde_json::Value,
    /// When the change that produced this snapshot happened
    pub stamp: EventStamp,
}

impl MirrorRecord {
    /// Create a new record.
    pub fn new(
        id: impl Into<EntityId>,
        table: impl Into<TableName>,
        entity: serde_json::Value,
        stamp: EventStamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            entity,
            stamp,
        }
    }

    /// True if an event with `stamp` would be older than this record.
    pub fn is_newer_than(&self, stamp: &EventStamp) -> bool {
        stamp.is_before(&self.stamp)
    }

    /// Replace the entity snapshot.
    pub fn replace(&mut self, entity: serde_json::Value, stamp: EventStamp) {
        self.entity = entity;
        self.stamp = stamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_record() {
        let record = MirrorRecord::new("flour", "stock", json!({"quantity": 1}), EventStamp::at(1));
        assert_eq!(record.id, "flour");
        assert_eq!(record.table, "stock");
        assert_eq!(record.stamp.occurred_at, 1);
    }

    #[test]
    fn replace_record() {
        let mut record =
            MirrorRecord::new("flour", "stock", json!({"quantity": 1}), EventStamp::at(1));
        record.replace(json!({"quantity": 2}), EventStamp::at(2));
        assert_eq!(record.entity, json!({"quantity": 2}));
        assert_eq!(record.stamp, EventStamp::at(2));
    }

    #[test]
    fn newer_than() {
        let record = MirrorRecord::new("flour", "stock", json!({}), EventStamp::at(10));
        assert!(record.is_newer_than(&EventStamp::at(9)));
        assert!(!record.is_newer_than(&EventStamp::at(10)));
        assert!(!record.is_newer_than(&EventStamp::at(11)));
    }

    #[test]
    fn serialization_roundtrip() {
        let record =
            MirrorRecord::new("1", "sales", json!({"total": 9.5}), EventStamp::with_seq(3, 1));
        let json = serde_json::to_string(&record).unwrap();
        let parsed: MirrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }
}
