//! Mirror store - the local cache of remote table state.
//!
//! The mirror holds the latest known snapshot of every entity in every
//! watched table. It is the single source of truth the UI reads while
//! possibly offline.
//!
//! Events are ordered by their [`EventStamp`], never by arrival: an event
//! older than what is stored for the same id is rejected with
//! [`Error::OrderingConflict`]. Deletes leave a tombstone stamp behind (not
//! visible through [`MirrorStore::snapshot`]) so a stale insert arriving after
//! the delete cannot resurrect the entity.

use crate::{
    error::Result, Catalog, DomainEvent, EntityId, Error, EventKind, EventStamp, MirrorRecord,
    TableName, TableSnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The mirrored state of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMirror {
    records: BTreeMap<EntityId, MirrorRecord>,
    #[serde(default)]
    tombstones: BTreeMap<EntityId, EventStamp>,
}

impl TableMirror {
    /// Create an empty table mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a record by ID.
    pub fn get(&self, id: &str) -> Option<&MirrorRecord> {
        self.records.get(id)
    }

    /// All records, ordered by id.
    pub fn records(&self) -> impl Iterator<Item = &MirrorRecord> {
        self.records.values()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the table has no live records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The newest stamp known for `id`, live or deleted.
    fn latest_stamp(&self, id: &str) -> Option<EventStamp> {
        match (self.records.get(id), self.tombstones.get(id)) {
            (Some(record), Some(tomb)) => Some(record.stamp.max(*tomb)),
            (Some(record), None) => Some(record.stamp),
            (None, Some(tomb)) => Some(*tomb),
            (None, None) => None,
        }
    }
}

/// Result of applying an event to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record was inserted or replaced
    Upserted { id: EntityId },
    /// The record was removed; `existed` is false if it was never mirrored
    Removed { id: EntityId, existed: bool },
}

impl ApplyOutcome {
    /// The entity id the event touched.
    pub fn id(&self) -> &EntityId {
        match self {
            ApplyOutcome::Upserted { id } => id,
            ApplyOutcome::Removed { id, .. } => id,
        }
    }
}

/// Result of replacing a table's contents from a full fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaceOutcome {
    /// Rows stored
    pub stored: usize,
    /// Rows dropped because they could not be identified
    pub rejected: Vec<Error>,
}

/// Local mirror of all watched tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorStore {
    tables: HashMap<TableName, TableMirror>,
}

impl MirrorStore {
    /// Create a mirror with an empty table for every catalog entry.
    pub fn new(catalog: &Catalog) -> Self {
        let tables = catalog
            .tables()
            .map(|t| (t.name.clone(), TableMirror::new()))
            .collect();
        Self { tables }
    }

    /// Apply a normalized event.
    ///
    /// Insert and update upsert the record keyed by entity id; delete removes
    /// it. Events older than the stored state for the same id fail with
    /// [`Error::OrderingConflict`] and leave the mirror untouched. An event
    /// with the same stamp as the stored one is re-applied.
    pub fn apply_event(&mut self, catalog: &Catalog, event: &DomainEvent) -> Result<ApplyOutcome> {
        let spec = catalog.require(&event.table)?;
        let id = spec.entity_id(&event.entity)?;

        let mirror = self
            .tables
            .get_mut(&event.table)
            .ok_or_else(|| Error::UnknownTable(event.table.clone()))?;

        if let Some(latest) = mirror.latest_stamp(&id) {
            if event.stamp.is_before(&latest) {
                return Err(Error::OrderingConflict {
                    table: event.table.clone(),
                    id,
                    incoming: event.stamp.occurred_at,
                    stored: latest.occurred_at,
                });
            }
        }

        match event.kind {
            EventKind::Insert | EventKind::Update => {
                mirror.tombstones.remove(&id);
                match mirror.records.get_mut(&id) {
                    Some(record) => record.replace(event.entity.clone(), event.stamp),
                    None => {
                        mirror.records.insert(
                            id.clone(),
                            MirrorRecord::new(
                                id.clone(),
                                event.table.clone(),
                                event.entity.clone(),
                                event.stamp,
                            ),
                        );
                    }
                }
                Ok(ApplyOutcome::Upserted { id })
            }
            EventKind::Delete => {
                let existed = mirror.records.remove(&id).is_some();
                mirror.tombstones.insert(id.clone(), event.stamp);
                Ok(ApplyOutcome::Removed { id, existed })
            }
        }
    }

    /// Replace a table's contents with a full fetch.
    ///
    /// Tombstones are cleared: the fetch is the server's word on what exists.
    /// Rows without a usable id are dropped and reported.
    pub fn replace_snapshot(
        &mut self,
        catalog: &Catalog,
        table: &str,
        entities: Vec<(serde_json::Value, EventStamp)>,
    ) -> Result<ReplaceOutcome> {
        let spec = catalog.require(table)?;
        let mut outcome = ReplaceOutcome::default();
        let mut fresh = TableMirror::new();

        for (entity, stamp) in entities {
            match spec.entity_id(&entity) {
                Ok(id) => {
                    fresh.records.insert(
                        id.clone(),
                        MirrorRecord::new(id, table.to_string(), entity, stamp),
                    );
                }
                Err(e) => outcome.rejected.push(e),
            }
        }

        outcome.stored = fresh.len();
        self.tables.insert(table.to_string(), fresh);
        Ok(outcome)
    }

    /// Current entities of a table, ordered by id.
    ///
    /// Unknown tables yield an empty snapshot.
    pub fn snapshot(&self, table: &str) -> Vec<serde_json::Value> {
        self.tables
            .get(table)
            .map(|t| t.records().map(|r| r.entity.clone()).collect())
            .unwrap_or_default()
    }

    /// Get a record by table and ID.
    pub fn get(&self, table: &str, id: &str) -> Option<&MirrorRecord> {
        self.tables.get(table).and_then(|t| t.get(id))
    }

    /// Get a table mirror by name.
    pub fn table(&self, table: &str) -> Option<&TableMirror> {
        self.tables.get(table)
    }

    /// Export one table for persistence.
    pub fn export_table(&self, table: &str) -> Option<TableSnapshot> {
        self.tables
            .get(table)
            .map(|mirror| TableSnapshot::new(table, mirror.clone()))
    }

    /// Import a persisted table.
    ///
    /// Tables no longer in the catalog are refused.
    pub fn import_table(&mut self, catalog: &Catalog, snapshot: TableSnapshot) -> Result<()> {
        snapshot.validate(catalog)?;
        self.tables.insert(snapshot.table, snapshot.mirror);
        Ok(())
    }
}
