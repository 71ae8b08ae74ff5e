//! Cross-module event deriver.
//!
//! Holds the registered [`DerivationRule`]s and the durable set of processed
//! idempotency keys. For a matching event the key is checked, recorded and
//! persisted under one lock before the derived mutation is handed back for
//! submission; if the key cannot be persisted nothing is submitted.

use std::sync::Arc;

use tillsync_engine::{
    DerivationPlan, DerivationRule, DomainEvent, EventKind, IdempotencyKey, Mutation,
    ProcessedKeys, TableName,
};
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::store::{DurableStore, StoreError, DERIVED_KEYS_KEY};

/// A derived mutation whose key is already durably recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    pub rule: String,
    pub key: IdempotencyKey,
    pub mutation: Mutation,
}

#[derive(Debug, Default)]
struct DeriverState {
    rules: Vec<DerivationRule>,
    processed: ProcessedKeys,
}

/// Applies derivation rules at most once per idempotency key.
#[derive(Debug)]
pub struct Deriver {
    state: Mutex<DeriverState>,
    store: Arc<dyn DurableStore>,
}

impl Deriver {
    /// Load processed keys from the store, with no rules registered.
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Self> {
        let processed = match store.get(DERIVED_KEYS_KEY)? {
            Some(json) => ProcessedKeys::from_json(&json)
                .map_err(|e| SyncError::Persistence(StoreError::Serialization(e.to_string())))?,
            None => ProcessedKeys::new(),
        };

        Ok(Self {
            state: Mutex::new(DeriverState {
                rules: Vec::new(),
                processed,
            }),
            store,
        })
    }

    fn persist(&self, keys: &ProcessedKeys) -> std::result::Result<(), StoreError> {
        let json = keys
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.set(DERIVED_KEYS_KEY, &json)
    }

    /// Register a rule.
    pub async fn register_rule(&self, rule: DerivationRule) {
        tracing::info!(
            rule = %rule.name,
            table = %rule.source_table,
            kind = %rule.source_kind,
            "Derivation rule registered"
        );
        self.state.lock().await.rules.push(rule);
    }

    /// The `(table, kind)` pairs that trigger some rule.
    pub async fn sources(&self) -> Vec<(TableName, EventKind)> {
        let state = self.state.lock().await;
        let mut sources: Vec<_> = state
            .rules
            .iter()
            .map(|r| (r.source_table.clone(), r.source_kind))
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }

    /// Check whether a key was processed.
    pub async fn is_processed(&self, key: &str) -> bool {
        self.state.lock().await.processed.contains(key)
    }

    /// Number of processed keys.
    pub async fn processed_count(&self) -> usize {
        self.state.lock().await.processed.len()
    }

    /// Run every matching rule against `event`.
    ///
    /// New keys are recorded and persisted before anything is returned. If
    /// the write fails the keys are forgotten again and the error returned.
    pub async fn prepare(&self, event: &DomainEvent) -> Result<Vec<Derivation>> {
        let mut state = self.state.lock().await;
        let DeriverState { rules, processed } = &mut *state;

        let mut derived = Vec::new();
        for rule in rules.iter() {
            match rule.plan(event, processed) {
                None => {}
                Some(DerivationPlan::Submit { key, mutation }) => {
                    processed.insert(key.clone());
                    derived.push(Derivation {
                        rule: rule.name.clone(),
                        key,
                        mutation,
                    });
                }
                Some(DerivationPlan::AlreadyProcessed { key }) => {
                    tracing::debug!(rule = %rule.name, key = %key, "Derivation already processed, skipping");
                }
                Some(DerivationPlan::Declined { key }) => {
                    tracing::debug!(rule = %rule.name, key = %key, "Nothing to derive");
                }
                Some(DerivationPlan::InvalidSource { error }) => {
                    tracing::warn!(rule = %rule.name, error = %error, "Derivation source rejected");
                }
            }
        }

        if derived.is_empty() {
            return Ok(derived);
        }

        if let Err(e) = self.persist(processed) {
            for d in &derived {
                processed.remove(&d.key);
            }
            tracing::error!(error = %e, "Failed to persist derivation keys, derivation blocked");
            return Err(e.into());
        }

        Ok(derived)
    }

    /// Forget a key whose derived mutation could not be submitted, so a later
    /// resync derives it again.
    pub async fn release(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.processed.remove(key) {
            self.persist(&state.processed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tillsync_engine::{sale_cash_movement_rule, EventStamp};

    fn sale(id: &str) -> DomainEvent {
        DomainEvent::new(
            "sales",
            EventKind::Insert,
            json!({"id": id, "total": 10, "status": "completed"}),
            EventStamp::at(1),
        )
    }

    async fn deriver(store: Arc<MemoryStore>) -> Deriver {
        let deriver = Deriver::load(store).unwrap();
        deriver.register_rule(sale_cash_movement_rule()).await;
        deriver
    }

    #[tokio::test]
    async fn derives_once_per_key() {
        let deriver = deriver(Arc::new(MemoryStore::new())).await;

        let first = deriver.prepare(&sale("sale-42")).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, "sale_cash_movement:sale-42");
        assert_eq!(first[0].mutation.table, "cash_movements");

        assert!(deriver.prepare(&sale("sale-42")).await.unwrap().is_empty());
        assert_eq!(deriver.processed_count().await, 1);
    }

    #[tokio::test]
    async fn keys_survive_restart() {
        let store = Arc::new(MemoryStore::new());
        deriver(store.clone())
            .await
            .prepare(&sale("sale-1"))
            .await
            .unwrap();

        let restarted = deriver(store).await;
        assert!(restarted.is_processed("sale_cash_movement:sale-1").await);
        assert!(restarted.prepare(&sale("sale-1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_failure_blocks_derivation() {
        let store = Arc::new(MemoryStore::new());
        let deriver = deriver(store.clone()).await;

        store.fail_writes(true);
        let err = deriver.prepare(&sale("sale-7")).await.unwrap_err();
        assert!(err.is_persistence());
        assert!(!deriver.is_processed("sale_cash_movement:sale-7").await);

        store.fail_writes(false);
        assert_eq!(deriver.prepare(&sale("sale-7")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_allows_rederivation() {
        let deriver = deriver(Arc::new(MemoryStore::new())).await;
        deriver.prepare(&sale("s")).await.unwrap();
        deriver.release("sale_cash_movement:s").await.unwrap();
        assert_eq!(deriver.prepare(&sale("s")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_matching_events_are_ignored() {
        let deriver = deriver(Arc::new(MemoryStore::new())).await;
        let stock = DomainEvent::new(
            "stock",
            EventKind::Insert,
            json!({"id": "flour"}),
            EventStamp::at(1),
        );
        assert!(deriver.prepare(&stock).await.unwrap().is_empty());
        assert_eq!(
            deriver.sources().await,
            vec![("sales".to_string(), EventKind::Insert)]
        );
    }

    #[tokio::test]
    async fn concurrent_duplicates_derive_once() {
        let deriver = Arc::new(deriver(Arc::new(MemoryStore::new())).await);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let deriver = deriver.clone();
                tokio::spawn(async move { deriver.prepare(&sale("sale-42")).await.unwrap().len() })
            })
            .collect();

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 1);
    }
}
