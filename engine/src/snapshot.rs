//! Snapshot types for persisting and restoring mirrored tables.
//!
//! Snapshots are the bridge between the in-memory [`MirrorStore`] and durable
//! storage. Each table is persisted on its own so one busy table does not
//! rewrite the others.
//!
//! [`MirrorStore`]: crate::MirrorStore

use crate::{error::Result, Catalog, Error, TableMirror, TableName};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of one mirrored table.
///
/// Records are kept in id order so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Table name
    pub table: TableName,
    /// Live records and tombstones
    pub mirror: TableMirror,
}

impl TableSnapshot {
    /// Create a snapshot of a table mirror.
    pub fn new(table: impl Into<TableName>, mirror: TableMirror) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            table: table.into(),
            mirror,
        }
    }

    /// Number of live records.
    pub fn record_count(&self) -> usize {
        self.mirror.len()
    }

    /// Validate the snapshot against a catalog.
    pub fn validate(&self, catalog: &Catalog) -> Result<()> {
        let spec = catalog.require(&self.table)?;

        for record in self.mirror.records() {
            if record.table != self.table {
                return Err(Error::InvalidSnapshot(format!(
                    "record '{}' belongs to '{}', not '{}'",
                    record.id, record.table, self.table
                )));
            }
            let id = spec.entity_id(&record.entity)?;
            if id != record.id {
                return Err(Error::InvalidSnapshot(format!(
                    "record key '{}' does not match entity id '{}'",
                    record.id, id
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::UnsupportedFormat {
                found: snapshot.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DomainEvent, EventKind, EventStamp, MirrorStore, TableSpec};
    use serde_json::json;

    fn catalog() -> Catalog {
        Catalog::new().with_table(TableSpec::new("stock", "stock"))
    }

    fn populated() -> TableSnapshot {
        let catalog = catalog();
        let mut mirror = MirrorStore::new(&catalog);
        mirror
            .apply_event(
                &catalog,
                &DomainEvent::new(
                    "stock",
                    EventKind::Insert,
                    json!({"id": "flour", "quantity": 2}),
                    EventStamp::at(100),
                ),
            )
            .unwrap();
        mirror.export_table("stock").unwrap()
    }

    #[test]
    fn create_empty_snapshot() {
        let snapshot = TableSnapshot::new("stock", TableMirror::new());
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.record_count(), 0);
        assert!(snapshot.validate(&catalog()).is_ok());
    }

    #[test]
    fn json_roundtrip() {
        let snapshot = populated();
        let json = snapshot.to_json().unwrap();
        let parsed = TableSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot, parsed);
        assert_eq!(parsed.record_count(), 1);
    }

    #[test]
    fn pretty_json_parses_too() {
        let snapshot = populated();
        let json = serde_json::to_string_pretty(&snapshot).unwrap();
        assert!(json.contains('\n'));
        assert_eq!(TableSnapshot::from_json(&json).unwrap(), snapshot);
    }

    #[test]
    fn newer_format_is_rejected() {
        let mut snapshot = populated();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let json = serde_json::to_string(&snapshot).unwrap();

        assert!(matches!(
            TableSnapshot::from_json(&json),
            Err(Error::UnsupportedFormat { found, .. }) if found == SNAPSHOT_FORMAT_VERSION + 1
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(
            TableSnapshot::from_json("not json"),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn validate_unknown_table() {
        let snapshot = TableSnapshot::new("orders", TableMirror::new());
        assert!(matches!(
            snapshot.validate(&catalog()),
            Err(Error::UnknownTable(t)) if t == "orders"
        ));
    }

    #[test]
    fn validate_mismatched_key() {
        let json = r#"{
            "formatVersion": 1,
            "table": "stock",
            "mirror": {
                "records": {
                    "flour": {
                        "id": "flour",
                        "table": "stock",
                        "entity": {"id": "sugar"},
                        "stamp": {"occurredAt": 1}
                    }
                }
            }
        }"#;
        let snapshot = TableSnapshot::from_json(json).unwrap();
        assert!(matches!(
            snapshot.validate(&catalog()),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
