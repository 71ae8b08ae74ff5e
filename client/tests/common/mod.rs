//! Shared helpers for the client integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tillsync_client::{DurableStore, EngineConfig, MemoryTransport, SyncEngine};
use tillsync_engine::{Backoff, Mutation};

/// Poll `$cond` until it holds, failing the test after five seconds.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }};
}

/// Config with a short reconnect backoff.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_backoff(Backoff::new(10, 40))
}

pub async fn live_engine(
    transport: Arc<MemoryTransport>,
    store: Arc<dyn DurableStore>,
) -> SyncEngine {
    let engine = SyncEngine::builder()
        .with_config(fast_config())
        .with_transport(transport)
        .with_store(store)
        .build()
        .await
        .unwrap();
    assert!(engine.is_live());
    engine
}

pub async fn wait_connected(engine: &SyncEngine) {
    let mut rx = engine.watch_connection();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_connected()))
        .await
        .expect("engine did not connect")
        .expect("connection watch closed");
}

/// A completed sale, labelled so tests can follow it through the backend.
pub fn sale_mutation(label: &str) -> Mutation {
    Mutation::insert(
        "sales",
        json!({"label": label, "total": 10.0, "status": "completed"}),
    )
}

/// Labels of the sales the backend confirmed, in order.
pub fn sale_labels(mutations: &[Mutation]) -> Vec<String> {
    mutations
        .iter()
        .filter(|m| m.table == "sales")
        .filter_map(|m| m.payload["label"].as_str().map(str::to_string))
        .collect()
}

/// Number of confirmed cash movements derived from `sale_id`.
pub async fn movements_for(transport: &MemoryTransport, sale_id: &str) -> usize {
    transport
        .sent()
        .await
        .iter()
        .filter(|m| m.table == "cash_movements" && m.payload["sale_id"] == sale_id)
        .count()
}

pub fn notification(table: &str, event_type: &str, entity: Value, at: &str, seq: u64) -> Value {
    json!({
        "table": table,
        "eventType": event_type,
        "new": entity,
        "old": null,
        "commitTimestamp": at,
        "seq": seq,
    })
}

/// Emit a marker product and wait until the engine mirrored it.
///
/// Notifications are handled in order, so everything emitted before the
/// marker has been processed once it shows up.
pub async fn flush(engine: &SyncEngine, transport: &MemoryTransport, marker: &str) {
    assert!(
        transport
            .emit(notification(
                "products",
                "INSERT",
                json!({"id": marker, "name": marker}),
                "2030-01-01T00:00:00Z",
                0,
            ))
            .await
    );
    eventually!(
        format!("marker {}", marker),
        engine
            .snapshot("products")
            .await
            .iter()
            .any(|p| p["id"] == marker)
    );
}
