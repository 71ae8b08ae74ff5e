//! Mutation types for expressing writes to the remote service.
//!
//! Every write the engine performs, whether submitted by UI code or derived
//! from another table's event, is expressed as a [`Mutation`]. The same value
//! is sent directly when connected and queued verbatim when not.

use crate::{EntityId, TableName};
use serde::{Deserialize, Serialize};

/// What a mutation does to its target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Insert,
    Update,
    /// Insert, or overwrite the row with the same id
    Upsert,
    Delete,
}

impl std::fmt::Display for MutationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationAction::Insert => write!(f, "insert"),
            MutationAction::Update => write!(f, "update"),
            MutationAction::Upsert => write!(f, "upsert"),
            MutationAction::Delete => write!(f, "delete"),
        }
    }
}

/// A write against one table of the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Target table
    pub table: TableName,
    /// Kind of write
    pub action: MutationAction,
    /// Row data; for update/delete it must carry the id field
    pub payload: serde_json::Value,
}

impl Mutation {
    /// Create a new mutation.
    pub fn new(
        table: impl Into<TableName>,
        action: MutationAction,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            table: table.into(),
            action,
            payload,
        }
    }

    /// Create an insert mutation.
    pub fn insert(table: impl Into<TableName>, payload: serde_json::Value) -> Self {
        Self::new(table, MutationAction::Insert, payload)
    }

    /// Create an update mutation.
    pub fn update(table: impl Into<TableName>, payload: serde_json::Value) -> Self {
        Self::new(table, MutationAction::Update, payload)
    }

    /// Create an upsert mutation.
    pub fn upsert(table: impl Into<TableName>, payload: serde_json::Value) -> Self {
        Self::new(table, MutationAction::Upsert, payload)
    }

    /// Create a delete mutation for the row with the given `id`.
    pub fn delete(table: impl Into<TableName>, id: impl Into<EntityId>) -> Self {
        Self::new(
            table,
            MutationAction::Delete,
            serde_json::json!({ "id": id.into() }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_action() {
        assert_eq!(
            Mutation::insert("sales", json!({})).action,
            MutationAction::Insert
        );
        assert_eq!(
            Mutation::update("sales", json!({})).action,
            MutationAction::Update
        );
        assert_eq!(
            Mutation::upsert("sales", json!({})).action,
            MutationAction::Upsert
        );

        let delete = Mutation::delete("sales", "sale-1");
        assert_eq!(delete.action, MutationAction::Delete);
        assert_eq!(delete.payload, json!({"id": "sale-1"}));
    }

    #[test]
    fn serialization_format() {
        let mutation = Mutation::insert("stock", json!({"product_id": "flour", "quantity": 2}));
        let json = serde_json::to_value(&mutation).unwrap();
        assert_eq!(json["table"], "stock");
        assert_eq!(json["action"], "insert");
        assert_eq!(json["payload"]["quantity"], 2);
    }

    #[test]
    fn action_display() {
        assert_eq!(MutationAction::Upsert.to_string(), "upsert");
        assert_eq!(MutationAction::Delete.to_string(), "delete");
    }
}
