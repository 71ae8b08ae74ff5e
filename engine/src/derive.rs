//! Cross-table derivation rules.
//!
//! A [`DerivationRule`] turns an event in one table into a mutation in
//! another, such as a cash-ledger entry for every completed sale. Rules are
//! stateless; the [`ProcessedKeys`] set remembers which source entities
//! already produced their derived mutation, so a source event observed twice
//! (live, then again through a resync) still derives exactly once.

use crate::{
    error::Result, DomainEvent, Error, EventKind, IdempotencyKey, Mutation, TableName,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Name of the built-in sale → cash movement rule.
pub const SALE_CASH_MOVEMENT: &str = "sale_cash_movement";

/// Version of the persisted key set format.
const KEYS_FORMAT_VERSION: u32 = 1;

/// Computes the derived mutation; `None` declines (nothing to derive).
pub type DeriveFn = Arc<dyn Fn(&serde_json::Value) -> Option<Mutation> + Send + Sync>;

/// Computes the idempotency key; `None` means the entity cannot be keyed.
pub type KeyFn = Arc<dyn Fn(&serde_json::Value) -> Option<IdempotencyKey> + Send + Sync>;

/// Maps a source event to a derived mutation.
#[derive(Clone)]
pub struct DerivationRule {
    /// Rule name, used in logs
    pub name: String,
    /// Table whose events trigger the rule
    pub source_table: TableName,
    /// Event kind that triggers the rule
    pub source_kind: EventKind,
    derive: DeriveFn,
    idempotency_key: KeyFn,
}

impl std::fmt::Debug for DerivationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationRule")
            .field("name", &self.name)
            .field("source_table", &self.source_table)
            .field("source_kind", &self.source_kind)
            .finish_non_exhaustive()
    }
}

impl DerivationRule {
    /// Create a new rule.
    pub fn new<D, K>(
        name: impl Into<String>,
        source_table: impl Into<TableName>,
        source_kind: EventKind,
        derive: D,
        idempotency_key: K,
    ) -> Self
    where
        D: Fn(&serde_json::Value) -> Option<Mutation> + Send + Sync + 'static,
        K: Fn(&serde_json::Value) -> Option<IdempotencyKey> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            source_table: source_table.into(),
            source_kind,
            derive: Arc::new(derive),
            idempotency_key: Arc::new(idempotency_key),
        }
    }

    /// Check whether an event triggers this rule.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        event.table == self.source_table && event.kind == self.source_kind
    }

    /// Idempotency key for a source entity.
    pub fn key_for(&self, entity: &serde_json::Value) -> Option<IdempotencyKey> {
        (self.idempotency_key)(entity)
    }

    /// Derived mutation for a source entity.
    pub fn derive(&self, entity: &serde_json::Value) -> Option<Mutation> {
        (self.derive)(entity)
    }

    /// Decide what to do with an event, given the keys already processed.
    ///
    /// Returns `None` when the rule does not match the event.
    pub fn plan(&self, event: &DomainEvent, processed: &ProcessedKeys) -> Option<DerivationPlan> {
        if !self.matches(event) {
            return None;
        }

        let key = match self.key_for(&event.entity) {
            Some(key) => key,
            None => {
                return Some(DerivationPlan::InvalidSource {
                    error: Error::InvalidPayload(format!(
                        "rule '{}' cannot key entity from '{}'",
                        self.name, event.table
                    )),
                })
            }
        };

        if processed.contains(&key) {
            return Some(DerivationPlan::AlreadyProcessed { key });
        }

        Some(match self.derive(&event.entity) {
            Some(mutation) => DerivationPlan::Submit { key, mutation },
            None => DerivationPlan::Declined { key },
        })
    }
}

/// What a rule wants done for one event.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivationPlan {
    /// Record `key`, then submit `mutation`
    Submit {
        key: IdempotencyKey,
        mutation: Mutation,
    },
    /// The key was processed before; nothing to do
    AlreadyProcessed { key: IdempotencyKey },
    /// The rule has nothing to derive for this entity
    Declined { key: IdempotencyKey },
    /// The source entity cannot be keyed
    InvalidSource { error: Error },
}

impl DerivationPlan {
    /// The duplicate outcome as an error value, for callers that log it.
    pub fn conflict(&self) -> Option<Error> {
        match self {
            DerivationPlan::AlreadyProcessed { key } => Some(Error::DerivationConflict(key.clone())),
            _ => None,
        }
    }
}

/// Durable set of idempotency keys whose derivation was already issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedKeys {
    format_version: u32,
    keys: BTreeSet<IdempotencyKey>,
}

impl Default for ProcessedKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessedKeys {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            format_version: KEYS_FORMAT_VERSION,
            keys: BTreeSet::new(),
        }
    }

    /// Check whether a key was processed.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Record a key. Returns `false` if it was already present.
    pub fn insert(&mut self, key: impl Into<IdempotencyKey>) -> bool {
        self.keys.insert(key.into())
    }

    /// Forget a key, undoing an insert whose persistence failed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    /// Number of recorded keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if no keys are recorded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Serialize for durable storage.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from durable storage.
    pub fn from_json(json: &str) -> Result<Self> {
        let keys: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if keys.format_version > KEYS_FORMAT_VERSION {
            return Err(Error::UnsupportedFormat {
                found: keys.format_version,
                supported: KEYS_FORMAT_VERSION,
            });
        }

        Ok(keys)
    }
}

/// Id of the cash movement derived from a sale.
fn sale_id(sale: &serde_json::Value) -> Option<String> {
    match sale.get("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Number(n)) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// Every completed sale produces one income entry in the cash ledger.
///
/// The ledger row id is `sale-<saleId>` and the write is an upsert, so even a
/// duplicate that slipped past the key set lands on the same row.
pub fn sale_cash_movement_rule() -> DerivationRule {
    DerivationRule::new(
        SALE_CASH_MOVEMENT,
        "sales",
        EventKind::Insert,
        |sale| {
            let id = sale_id(sale)?;

            let completed = match sale.get("status") {
                None | Some(serde_json::Value::Null) => true,
                Some(status) => status.as_str() == Some("completed"),
            };
            if !completed {
                return None;
            }

            let amount = sale.get("total").and_then(|t| t.as_f64())?;

            let mut movement = serde_json::json!({
                "id": format!("sale-{}", id),
                "sale_id": id,
                "kind": "income",
                "amount": amount,
                "description": format!("Sale {}", id),
            });
            if let Some(obj) = movement.as_object_mut() {
                if let Some(method) = sale.get("payment_method").filter(|v| !v.is_null()) {
                    obj.insert("payment_method".into(), method.clone());
                }
                if let Some(at) = sale.get("created_at").filter(|v| !v.is_null()) {
                    obj.insert("occurred_at".into(), at.clone());
                }
            }

            Some(Mutation::upsert("cash_movements", movement))
        },
        |sale| sale_id(sale).map(|id| format!("{}:{}", SALE_CASH_MOVEMENT, id)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventStamp, MutationAction};
    use serde_json::json;

    fn sale_event(entity: serde_json::Value) -> DomainEvent {
        DomainEvent::new("sales", EventKind::Insert, entity, EventStamp::at(1))
    }

    #[test]
    fn rule_matches_table_and_kind() {
        let rule = sale_cash_movement_rule();
        assert!(rule.matches(&sale_event(json!({"id": "1"}))));

        let update = DomainEvent::new("sales", EventKind::Update, json!({}), EventStamp::at(1));
        assert!(!rule.matches(&update));

        let other = DomainEvent::new("stock", EventKind::Insert, json!({}), EventStamp::at(1));
        assert!(!rule.matches(&other));
        assert!(rule.plan(&other, &ProcessedKeys::new()).is_none());
    }

    #[test]
    fn completed_sale_derives_cash_movement() {
        let rule = sale_cash_movement_rule();
        let event = sale_event(json!({
            "id": "sale-42",
            "total": 19.5,
            "status": "completed",
            "payment_method": "cash",
            "created_at": "2024-05-01T10:00:00Z"
        }));

        let plan = rule.plan(&event, &ProcessedKeys::new()).unwrap();
        let DerivationPlan::Submit { key, mutation } = plan else {
            panic!("expected submit, got {:?}", plan);
        };

        assert_eq!(key, "sale_cash_movement:sale-42");
        assert_eq!(mutation.table, "cash_movements");
        assert_eq!(mutation.action, MutationAction::Upsert);
        assert_eq!(mutation.payload["id"], "sale-sale-42");
        assert_eq!(mutation.payload["sale_id"], "sale-42");
        assert_eq!(mutation.payload["kind"], "income");
        assert_eq!(mutation.payload["amount"], 19.5);
        assert_eq!(mutation.payload["payment_method"], "cash");
        assert_eq!(mutation.payload["occurred_at"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn derived_mutation_passes_dashboard_validation() {
        let rule = sale_cash_movement_rule();
        let mutation = rule.derive(&json!({"id": 7, "total": 3})).unwrap();
        assert!(crate::Catalog::dashboard().validate_mutation(&mutation).is_ok());
    }

    #[test]
    fn pending_sale_is_declined() {
        let rule = sale_cash_movement_rule();
        let event = sale_event(json!({"id": "1", "total": 5, "status": "pending"}));
        assert!(matches!(
            rule.plan(&event, &ProcessedKeys::new()),
            Some(DerivationPlan::Declined { .. })
        ));
    }

    #[test]
    fn sale_without_id_is_invalid() {
        let rule = sale_cash_movement_rule();
        let event = sale_event(json!({"total": 5}));
        assert!(matches!(
            rule.plan(&event, &ProcessedKeys::new()),
            Some(DerivationPlan::InvalidSource { .. })
        ));
    }

    #[test]
    fn processed_key_is_skipped() {
        let rule = sale_cash_movement_rule();
        let mut keys = ProcessedKeys::new();
        keys.insert("sale_cash_movement:1");

        let plan = rule
            .plan(&sale_event(json!({"id": "1", "total": 5})), &keys)
            .unwrap();
        assert_eq!(
            plan.conflict(),
            Some(Error::DerivationConflict("sale_cash_movement:1".into()))
        );
    }

    #[test]
    fn keys_insert_remove() {
        let mut keys = ProcessedKeys::new();
        assert!(keys.is_empty());
        assert!(keys.insert("a"));
        assert!(!keys.insert("a"));
        assert!(keys.contains("a"));
        assert!(keys.remove("a"));
        assert!(!keys.contains("a"));
    }

    #[test]
    fn keys_json_roundtrip() {
        let mut keys = ProcessedKeys::new();
        keys.insert("b");
        keys.insert("a");
        let json = keys.to_json().unwrap();
        assert_eq!(ProcessedKeys::from_json(&json).unwrap(), keys);
    }

    #[test]
    fn rule_debug_hides_closures() {
        let debug = format!("{:?}", sale_cash_movement_rule());
        assert!(debug.contains("sale_cash_movement"));
        assert!(debug.contains(".."));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_repeated_event_derives_once(repeats in 1usize..20, total in 0u32..10_000) {
                let rule = sale_cash_movement_rule();
                let mut keys = ProcessedKeys::new();
                let event = sale_event(json!({"id": "sale-42", "total": total}));
                let mut derived = 0;

                for _ in 0..repeats {
                    if let Some(DerivationPlan::Submit { key, .. }) = rule.plan(&event, &keys) {
                        keys.insert(key);
                        derived += 1;
                    }
                }

                prop_assert_eq!(derived, 1);
            }
        }
    }
}
