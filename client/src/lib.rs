//! # tillsync client
//!
//! Async runtime around [`tillsync_engine`]: keeps a local mirror of remote
//! tables current through a realtime change feed, queues work while offline
//! and replays it on reconnect, derives cash-ledger entries from sales, and
//! fans normalized events out to listeners.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tillsync_client::{EngineConfig, MemoryTransport, SyncEngine};
//!
//! # async fn run() -> tillsync_client::Result<()> {
//! let engine = SyncEngine::builder()
//!     .with_config(EngineConfig::from_env()?)
//!     .with_transport(Arc::new(MemoryTransport::new()))
//!     .build()
//!     .await?;
//!
//! let _handle = engine.add_listener("new_sale", |sale| {
//!     println!("sale {}", sale["entity"]["id"]);
//!     Ok(())
//! });
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod deriver;
pub mod dispatcher;
pub mod engine;
pub mod error;
mod live;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use deriver::{Derivation, Deriver};
pub use dispatcher::{Dispatcher, Listener, ListenerError, ListenerHandle};
pub use engine::{ResyncOutcome, SubmitOutcome, SyncEngine, SyncEngineBuilder};
pub use error::{Result, SyncError};
pub use monitor::{ConnectionMonitor, CONNECTION_EVENT};
pub use queue::{DrainOutcome, DurableQueue, OperationExecutor};
pub use registry::{ChannelRegistry, ChannelSubscription, EntityFilter};
pub use store::{DurableStore, FileStore, MemoryStore, StoreError};
pub use transport::{
    MemoryTransport, RealtimeTransport, TransportError, TransportEvent, TransportSink,
};

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> tillsync_engine::Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
