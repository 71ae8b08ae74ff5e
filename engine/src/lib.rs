//! # tillsync engine
//!
//! The deterministic core of the tillsync realtime synchronization engine.
//!
//! This crate holds the state and the rules; the async runtime that talks to
//! the network and to disk lives in `tillsync-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: nothing here touches files, sockets or clocks. Timestamps are
//!   passed in by the caller.
//! - **Deterministic**: the same sequence of inputs always produces the same
//!   state, regardless of the order events arrive in.
//! - **Testable**: pure values and state machines, no mocks needed.
//!
//! ## Core Concepts
//!
//! ### Domain events
//!
//! Remote change notifications are normalized into a [`DomainEvent`]: a table,
//! an [`EventKind`] (insert, update, delete), the entity and the moment it
//! happened ([`EventStamp`]).
//!
//! ### Mirror store
//!
//! The [`MirrorStore`] keeps the latest known snapshot of every watched table.
//! An event older than the stored record for the same id is rejected, so the
//! mirror converges on the newest state even when delivery is out of order.
//!
//! ### Operation queue
//!
//! Work that cannot reach the remote service is held in an [`OperationQueue`]
//! as [`QueuedOperation`]s and replayed strictly first-in, first-out.
//!
//! ### Derivation rules
//!
//! A [`DerivationRule`] maps an event in one table (a completed sale) to a
//! [`Mutation`] in another (a cash-ledger entry). The [`ProcessedKeys`] set
//! guarantees each rule fires at most once per source entity.
//!
//! ## Quick Start
//!
//! ```rust
//! use tillsync_engine::{
//!     Catalog, DomainEvent, EventKind, EventStamp, MirrorStore, TableSpec,
//! };
//! use serde_json::json;
//!
//! let catalog = Catalog::new().with_table(TableSpec::new("stock", "stock"));
//! let mut mirror = MirrorStore::new(&catalog);
//!
//! let newer = DomainEvent::new(
//!     "stock",
//!     EventKind::Update,
//!     json!({"id": "flour", "qty": 7}),
//!     EventStamp::at(2_000),
//! );
//! let older = DomainEvent::new(
//!     "stock",
//!     EventKind::Update,
//!     json!({"id": "flour", "qty": 9}),
//!     EventStamp::at(1_000),
//! );
//!
//! mirror.apply_event(&catalog, &newer).unwrap();
//! assert!(mirror.apply_event(&catalog, &older).is_err());
//!
//! let rows = mirror.snapshot("stock");
//! assert_eq!(rows[0]["qty"], 7);
//! ```

pub mod catalog;
pub mod clock;
pub mod connection;
pub mod derive;
pub mod error;
pub mod event;
pub mod mirror;
pub mod mutation;
pub mod queue;
pub mod record;
pub mod snapshot;

// Re-export main types at crate root
pub use catalog::{Catalog, FieldDef, FieldType, TableSpec};
pub use clock::EventStamp;
pub use connection::{Backoff, ConnectionSignal, ConnectionState, ConnectionStatus, Transition};
pub use derive::{
    sale_cash_movement_rule, DerivationPlan, DerivationRule, DeriveFn, KeyFn, ProcessedKeys,
    SALE_CASH_MOVEMENT,
};
pub use error::Error;
pub use event::{DomainEvent, EventKind};
pub use mirror::{ApplyOutcome, MirrorStore, ReplaceOutcome, TableMirror};
pub use mutation::{Mutation, MutationAction};
pub use queue::{Operation, OperationQueue, QueuedOperation, QUEUE_FORMAT_VERSION};
pub use record::MirrorRecord;
pub use snapshot::{TableSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type TableName = String;
pub type EntityId = String;
pub type OperationId = String;
pub type IdempotencyKey = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
