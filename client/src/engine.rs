//! The public engine handle.
//!
//! [`SyncEngine`] is built once per app session by [`SyncEngineBuilder`].
//! When realtime is disabled by configuration, or the transport reports it is
//! unavailable in this environment, the builder returns a disabled engine
//! with the same interface: listeners can be registered, snapshots read from
//! the persisted mirror, and everything else is a logged no-op.

use std::sync::Arc;

use serde_json::Value;
use tillsync_engine::{
    sale_cash_movement_rule, Catalog, ConnectionState, DerivationRule,
    MirrorStore, Mutation, OperationId, TableSnapshot,
};
use tokio::sync::watch;

use crate::config::{ConfigError, EngineConfig};
use crate::deriver::Deriver;
use crate::dispatcher::{Dispatcher, ListenerError, ListenerHandle};
use crate::error::{Result, SyncError};
use crate::live::{LiveEngine, LiveParts};
use crate::queue::{DrainOutcome, DurableQueue};
use crate::registry::{ChannelRegistry, ChannelSubscription};
use crate::store::{mirror_key, DurableStore, FileStore};
use crate::transport::RealtimeTransport;

/// What happened to a submitted mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Sent and confirmed by the backend
    Sent,
    /// Durably queued until the connection is back
    Queued { id: OperationId },
    /// The engine is disabled; nothing was done
    Ignored,
}

/// What happened to a resync request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// The table was fetched and its mirror replaced
    Synced { rows: usize },
    /// Offline; a resync was queued
    Queued { id: OperationId },
    /// The engine is disabled; nothing was done
    Ignored,
}

/// Handle to the sync engine.
#[derive(Debug)]
pub enum SyncEngine {
    Live(LiveEngine),
    Disabled(DisabledEngine),
}

/// Engine stand-in used when realtime is unavailable.
#[derive(Debug)]
pub struct DisabledEngine {
    mirror: MirrorStore,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<ConnectionState>,
}

impl SyncEngine {
    /// Start building an engine.
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Whether realtime sync is running.
    pub fn is_live(&self) -> bool {
        matches!(self, SyncEngine::Live(_))
    }

    /// Register a listener for a named event: `new_<entity>`,
    /// `<entity>_updated`, `<entity>_deleted`, `<table>_synced` or
    /// `connection`.
    pub fn add_listener<F>(&self, event: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) -> std::result::Result<(), ListenerError> + Send + Sync + 'static,
    {
        let dispatcher = match self {
            SyncEngine::Live(live) => &live.shared().dispatcher,
            SyncEngine::Disabled(disabled) => &disabled.dispatcher,
        };
        dispatcher.add_listener(event, callback)
    }

    /// Current connection state.
    pub fn connection_status(&self) -> ConnectionState {
        match self {
            SyncEngine::Live(live) => live.shared().monitor.status(),
            SyncEngine::Disabled(disabled) => disabled.state.borrow().clone(),
        }
    }

    /// Receiver notified on every connection state change.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        match self {
            SyncEngine::Live(live) => live.shared().monitor.watch(),
            SyncEngine::Disabled(disabled) => disabled.state.subscribe(),
        }
    }

    /// Current mirrored entities of a table, ordered by id.
    pub async fn snapshot(&self, table: &str) -> Vec<Value> {
        match self {
            SyncEngine::Live(live) => live.shared().mirror.read().await.snapshot(table),
            SyncEngine::Disabled(disabled) => disabled.mirror.snapshot(table),
        }
    }

    /// Submit a mutation. It is validated first; a malformed mutation is an
    /// error and never queued.
    pub async fn submit_mutation(&self, mutation: Mutation) -> Result<SubmitOutcome> {
        match self {
            SyncEngine::Live(live) => live.shared().submit_mutation(mutation).await,
            SyncEngine::Disabled(_) => {
                tracing::debug!(table = %mutation.table, "Realtime disabled, mutation ignored");
                Ok(SubmitOutcome::Ignored)
            }
        }
    }

    /// Re-fetch a table and replace its mirror, or queue that if offline.
    pub async fn resync_table(&self, table: &str) -> Result<ResyncOutcome> {
        match self {
            SyncEngine::Live(live) => live.shared().resync_table(table).await,
            SyncEngine::Disabled(_) => Ok(ResyncOutcome::Ignored),
        }
    }

    /// Watch a table, replacing any previous subscription for it.
    ///
    /// When connected the feed is started and the table resynced right away;
    /// otherwise both happen on the next connect.
    pub async fn subscribe(&self, subscription: ChannelSubscription) -> Result<()> {
        let SyncEngine::Live(live) = self else {
            return Ok(());
        };
        let shared = live.shared();
        if !shared.catalog.contains(&subscription.table) {
            return Err(SyncError::UnknownTable(subscription.table));
        }

        let table = subscription.table.clone();
        shared.registry.register(subscription);
        if shared.monitor.is_connected() {
            if let Err(e) = shared.registry.activate(live.transport(), &table).await {
                tracing::warn!(table = %table, error = %e, "Subscribe failed, retrying on reconnect");
                return Ok(());
            }
            shared.resync_table(&table).await?;
        }
        Ok(())
    }

    /// Add a derivation rule at runtime.
    pub async fn register_rule(&self, rule: DerivationRule) {
        if let SyncEngine::Live(live) = self {
            live.shared().deriver.register_rule(rule).await;
        }
    }

    /// Report platform network connectivity.
    pub fn set_network_online(&self, online: bool) {
        if let SyncEngine::Live(live) = self {
            live.set_network_online(online);
        }
    }

    /// Replay queued operations now. Returns
    /// [`DrainOutcome::AlreadyDraining`] if a drain is running.
    pub async fn drain_queue(&self) -> Result<DrainOutcome> {
        match self {
            SyncEngine::Live(live) => live.shared().drain_queue().await,
            SyncEngine::Disabled(_) => Ok(DrainOutcome::Completed {
                sent: 0,
                dropped: 0,
            }),
        }
    }

    /// Number of operations waiting in the offline queue.
    pub async fn pending_operations(&self) -> usize {
        match self {
            SyncEngine::Live(live) => live.shared().queue.len().await,
            SyncEngine::Disabled(_) => 0,
        }
    }

    /// Stop syncing. Calling it more than once is harmless.
    pub async fn shutdown(&self) {
        match self {
            SyncEngine::Live(live) => live.shutdown().await,
            SyncEngine::Disabled(_) => tracing::debug!("Disabled engine shut down"),
        }
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: EngineConfig,
    catalog: Catalog,
    transport: Option<Arc<dyn RealtimeTransport>>,
    store: Option<Arc<dyn DurableStore>>,
    subscriptions: Vec<ChannelSubscription>,
    rules: Vec<DerivationRule>,
    default_rules: bool,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngineBuilder {
    /// Defaults: the dashboard catalog, every table watched for every kind
    /// of change, and the sale-to-cash-movement rule. A configured table
    /// subset narrows which tables are watched, nothing else.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            catalog: Catalog::dashboard(),
            transport: None,
            store: None,
            subscriptions: Vec::new(),
            rules: Vec::new(),
            default_rules: true,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this store instead of a [`FileStore`] under the configured data
    /// directory.
    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the default all-kinds subscription for one table.
    pub fn with_subscription(mut self, subscription: ChannelSubscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn with_rule(mut self, rule: DerivationRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Do not register the built-in derivation rules.
    pub fn without_default_rules(mut self) -> Self {
        self.default_rules = false;
        self
    }

    /// Load durable state and start the engine.
    ///
    /// Must be called inside a tokio runtime. A corrupt queue or key document
    /// is an error; a corrupt mirror table only starts empty.
    pub async fn build(self) -> Result<SyncEngine> {
        let catalog = self.catalog;
        if let Some(tables) = &self.config.tables {
            let unknown = catalog.unknown_tables(tables);
            if !unknown.is_empty() {
                return Err(ConfigError::UnknownTables(unknown).into());
            }
        }

        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(&self.config.data_dir)?),
        };
        let mirror = load_mirror(&catalog, store.as_ref());
        let dispatcher = Dispatcher::new_shared();

        let transport = match self.transport {
            Some(t) if self.config.realtime_enabled && t.is_available() => t,
            _ => {
                tracing::info!(
                    realtime_enabled = self.config.realtime_enabled,
                    "Realtime unavailable, starting disabled engine"
                );
                return Ok(SyncEngine::Disabled(DisabledEngine::new(mirror, dispatcher)));
            }
        };

        // the table subset limits the feeds; mirror and validation keep the
        // whole catalog
        let registry = ChannelRegistry::new();
        let watched = catalog.tables().filter(|spec| match &self.config.tables {
            Some(tables) => tables.contains(&spec.name),
            None => true,
        });
        for spec in watched {
            registry.register(ChannelSubscription::all(spec.name.clone()));
        }
        for subscription in self.subscriptions {
            if !catalog.contains(&subscription.table) {
                return Err(SyncError::UnknownTable(subscription.table));
            }
            registry.register(subscription);
        }

        let queue = DurableQueue::load(store.clone())?;
        let deriver = Deriver::load(store.clone())?;
        if self.default_rules && catalog.contains("sales") && catalog.contains("cash_movements") {
            deriver.register_rule(sale_cash_movement_rule()).await;
        }
        for rule in self.rules {
            deriver.register_rule(rule).await;
        }

        Ok(SyncEngine::Live(LiveEngine::start(LiveParts {
            catalog,
            backoff: self.config.backoff,
            transport,
            store,
            dispatcher,
            registry,
            mirror,
            queue,
            deriver,
        })))
    }
}

/// Restore every catalog table from the store. Unreadable tables start
/// empty and are refilled by the next resync.
fn load_mirror(catalog: &Catalog, store: &dyn DurableStore) -> MirrorStore {
    let mut mirror = MirrorStore::new(catalog);

    for spec in catalog.tables() {
        let key = mirror_key(&spec.name);
        let json = match store.get(&key) {
            Ok(Some(json)) => json,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(table = %spec.name, error = %e, "Failed to read mirror");
                continue;
            }
        };

        let restored = TableSnapshot::from_json(&json)
            .and_then(|snapshot| mirror.import_table(catalog, snapshot));
        if let Err(e) = restored {
            tracing::warn!(table = %spec.name, error = %e, "Discarding unreadable mirror");
        }
    }

    mirror
}

impl DisabledEngine {
    /// Permanently `disconnected`; network reachability is not tracked.
    fn new(mirror: MirrorStore, dispatcher: Arc<Dispatcher>) -> Self {
        let (state, _) = watch::channel(ConnectionState::initial(crate::now_ms()));
        Self {
            mirror,
            dispatcher,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use tillsync_engine::{ConnectionStatus, DomainEvent, EventKind, EventStamp};

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn disabled_by_config() {
        let engine = SyncEngine::builder()
            .with_config(EngineConfig::default().with_realtime(false))
            .with_transport(Arc::new(MemoryTransport::new()))
            .with_store(memory_store())
            .build()
            .await
            .unwrap();

        assert!(!engine.is_live());
        let state = engine.connection_status();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.network_online);
        assert_eq!(state.reconnect_attempts, 0);
        let outcome = engine
            .submit_mutation(Mutation::insert("sales", json!({"total": 1.0})))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Ignored);
        assert_eq!(engine.resync_table("sales").await.unwrap(), ResyncOutcome::Ignored);
        engine.shutdown().await;
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_when_transport_unavailable() {
        let engine = SyncEngine::builder()
            .with_transport(Arc::new(MemoryTransport::unavailable()))
            .with_store(memory_store())
            .build()
            .await
            .unwrap();
        assert!(!engine.is_live());
    }

    #[tokio::test]
    async fn disabled_engine_serves_persisted_mirror() {
        let catalog = Catalog::dashboard();
        let store = memory_store();

        let mut mirror = MirrorStore::new(&catalog);
        mirror
            .apply_event(
                &catalog,
                &DomainEvent::new(
                    "products",
                    EventKind::Insert,
                    json!({"id": "p1", "name": "Flour"}),
                    EventStamp::at(1),
                ),
            )
            .unwrap();
        let json = mirror.export_table("products").unwrap().to_json().unwrap();
        store.set(&mirror_key("products"), &json).unwrap();
        store.set(&mirror_key("sales"), "not json").unwrap();

        let engine = SyncEngine::builder()
            .with_store(store)
            .build()
            .await
            .unwrap();

        assert_eq!(engine.snapshot("products").await[0]["name"], "Flour");
        assert!(engine.snapshot("sales").await.is_empty());
    }

    #[tokio::test]
    async fn unknown_configured_table_is_a_config_error() {
        let result = SyncEngine::builder()
            .with_config(EngineConfig::default().with_tables(["sales", "nope"]))
            .with_transport(Arc::new(MemoryTransport::new()))
            .with_store(memory_store())
            .build()
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Config(ConfigError::UnknownTables(ref t))) if t == &vec!["nope".to_string()]
        ));
    }

    #[tokio::test]
    async fn invalid_mutation_is_rejected_not_queued() {
        let engine = SyncEngine::builder()
            .with_transport(Arc::new(MemoryTransport::new()))
            .with_store(memory_store())
            .build()
            .await
            .unwrap();

        let err = engine
            .submit_mutation(Mutation::insert("sales", json!({"total": "lots"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Engine(_)));
        assert_eq!(engine.pending_operations().await, 0);

        assert!(matches!(
            engine.resync_table("nope").await,
            Err(SyncError::UnknownTable(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let engine = SyncEngine::builder()
            .with_transport(Arc::new(MemoryTransport::new()))
            .with_store(memory_store())
            .build()
            .await
            .unwrap();
        engine.shutdown().await;

        let err = engine
            .submit_mutation(Mutation::insert("sales", json!({"total": 1.0})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Shutdown));
    }
}
