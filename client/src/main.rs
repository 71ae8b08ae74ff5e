//! tillsync demo - runs the sync engine against the in-memory backend.
//!
//! Configuration comes from the environment (and `.env`): see
//! [`EngineConfig::from_env`]. The demo records a sale on the backend, lets
//! the engine derive its cash-ledger entry and prints both mirrors.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tillsync_client::telemetry::{init_tracing, DEFAULT_FILTER};
use tillsync_client::{EngineConfig, MemoryTransport, SyncEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(DEFAULT_FILTER);

    let config = EngineConfig::from_env()?;
    tracing::info!(data_dir = %config.data_dir.display(), "Starting tillsync demo");

    let backend = Arc::new(MemoryTransport::new());
    let engine = SyncEngine::builder()
        .with_config(config)
        .with_transport(backend.clone())
        .build()
        .await?;

    let _ledger = engine.add_listener("new_cash_movement", |event| {
        tracing::info!(entry = %event["entity"], "Cash movement recorded");
        Ok(())
    });

    let mut connection = engine.watch_connection();
    if tokio::time::timeout(Duration::from_secs(5), connection.wait_for(|s| s.is_connected()))
        .await
        .is_err()
    {
        tracing::warn!("Backend not reachable, sale will wait in the offline queue");
    }

    let sale = tillsync_engine::Mutation::insert(
        "sales",
        json!({"total": 12.5, "status": "completed", "payment_method": "cash"}),
    );
    let outcome = engine.submit_mutation(sale).await?;
    tracing::info!(outcome = ?outcome, "Sale submitted");

    tokio::time::sleep(Duration::from_millis(200)).await;

    for table in ["sales", "cash_movements"] {
        let rows = engine.snapshot(table).await;
        println!("{} ({} rows)", table, rows.len());
        for row in rows {
            println!("  {}", row);
        }
    }

    engine.shutdown().await;
    Ok(())
}
