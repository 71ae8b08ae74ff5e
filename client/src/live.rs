//! The running engine: shared state plus the one task that owns the
//! connection.
//!
//! The event loop serializes everything that touches the connection or
//! writes the mirror: connect attempts, drains, resyncs, transport events and
//! network changes. Public resync and drain requests reach it as
//! [`Command`]s. Submissions run on the caller's task under the send-order
//! lock, which the loop only ever tries and never waits for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tillsync_engine::{
    Backoff, Catalog, ConnectionSignal, DomainEvent, Error as EngineError, EventKind, EventStamp,
    MirrorStore, Mutation, Operation, QueuedOperation, TableName,
};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::deriver::Deriver;
use crate::dispatcher::Dispatcher;
use crate::engine::{ResyncOutcome, SubmitOutcome};
use crate::error::{Result, SyncError};
use crate::monitor::ConnectionMonitor;
use crate::queue::{DrainOutcome, DurableQueue, OperationExecutor};
use crate::registry::{parse_timestamp, ChannelRegistry};
use crate::store::{mirror_key, DurableStore, StoreError};
use crate::transport::{RealtimeTransport, TransportError, TransportEvent, TransportSink};

/// Requests from the public API to the event loop.
#[derive(Debug)]
enum Command {
    Network(bool),
    /// A direct send failed while connection `generation` was current
    TransportLost { generation: u64, message: String },
    Resync {
        table: TableName,
        reply: oneshot::Sender<Result<ResyncOutcome>>,
    },
    /// `reply` is `None` when nobody waits for the result
    Drain {
        reply: Option<oneshot::Sender<Result<DrainOutcome>>>,
    },
}

/// Everything a live engine is assembled from.
pub(crate) struct LiveParts {
    pub catalog: Catalog,
    pub backoff: Backoff,
    pub transport: Arc<dyn RealtimeTransport>,
    pub store: Arc<dyn DurableStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry: ChannelRegistry,
    pub mirror: MirrorStore,
    pub queue: DurableQueue,
    pub deriver: Deriver,
}

pub(crate) struct Shared {
    pub(crate) catalog: Catalog,
    backoff: Backoff,
    transport: Arc<dyn RealtimeTransport>,
    store: Arc<dyn DurableStore>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) monitor: ConnectionMonitor,
    pub(crate) registry: ChannelRegistry,
    pub(crate) mirror: RwLock<MirrorStore>,
    pub(crate) queue: DurableQueue,
    pub(crate) deriver: Deriver,
    /// Held across a direct send or a drain, so operations reach the
    /// backend in the order they were submitted
    send_order: Mutex<()>,
    control: mpsc::UnboundedSender<Command>,
    /// Bumped on every successful connect
    generation: AtomicU64,
    shut_down: AtomicBool,
}

/// A started engine and its event-loop task.
pub struct LiveEngine {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LiveEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveEngine")
            .field("status", &self.shared.monitor.status().status)
            .field("subscriptions", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

impl LiveEngine {
    /// Spawn the event loop. The first connect attempt starts immediately.
    pub(crate) fn start(parts: LiveParts) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            monitor: ConnectionMonitor::new(parts.dispatcher.clone()),
            catalog: parts.catalog,
            backoff: parts.backoff,
            transport: parts.transport,
            store: parts.store,
            dispatcher: parts.dispatcher,
            registry: parts.registry,
            mirror: RwLock::new(parts.mirror),
            queue: parts.queue,
            deriver: parts.deriver,
            send_order: Mutex::new(()),
            control,
            generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        let task = tokio::spawn(run(shared.clone(), control_rx));
        tracing::info!(tables = shared.registry.len(), "Sync engine started");

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn transport(&self) -> &dyn RealtimeTransport {
        self.shared.transport.as_ref()
    }

    pub(crate) fn set_network_online(&self, online: bool) {
        if self.shared.control.send(Command::Network(online)).is_err() {
            tracing::debug!(online, "Event loop stopped, network change ignored");
        }
    }

    /// Stop the event loop, tear down subscriptions and close the transport.
    ///
    /// Safe at any point, including mid-drain: the in-flight entry was not
    /// acknowledged and stays queued.
    pub(crate) async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        self.shared
            .registry
            .unsubscribe_all(self.shared.transport.as_ref())
            .await;
        self.shared.transport.disconnect().await;
        self.shared.monitor.signal(ConnectionSignal::TransportClosed);
        tracing::info!("Sync engine shut down");
    }
}

async fn run(shared: Arc<Shared>, mut control: mpsc::UnboundedReceiver<Command>) {
    let (sink, mut events) = mpsc::unbounded_channel();
    let mut retry_at = Some(Instant::now());

    loop {
        let deadline = retry_at;
        let reconnect = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = control.recv() => match command {
                Some(command) => retry_at = shared.handle_command(command, retry_at).await,
                None => break,
            },
            Some(event) = events.recv() => {
                retry_at = shared.handle_transport_event(event, retry_at).await;
            }
            _ = reconnect => {
                retry_at = shared.connect(&sink).await;
            }
        }
    }
}

impl Shared {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// When to try again after losing an established connection.
    fn retry_after_drop(&self) -> Option<Instant> {
        if self.is_shut_down() || !self.monitor.is_online() {
            return None;
        }
        let attempts = self.monitor.status().reconnect_attempts.max(1);
        Some(Instant::now() + self.backoff.delay(attempts))
    }

    async fn handle_command(&self, command: Command, retry_at: Option<Instant>) -> Option<Instant> {
        match command {
            Command::Network(true) => {
                self.monitor.signal(ConnectionSignal::NetworkOnline);
                if self.monitor.is_connected() {
                    retry_at
                } else {
                    Some(Instant::now())
                }
            }
            Command::Network(false) => {
                self.monitor.signal(ConnectionSignal::NetworkOffline);
                self.transport.disconnect().await;
                None
            }
            Command::TransportLost {
                generation,
                message,
            } => {
                if generation != self.generation.load(Ordering::SeqCst)
                    || !self.monitor.is_connected()
                {
                    return retry_at;
                }
                self.connection_lost(message).await
            }
            Command::Resync { table, reply } => {
                let (outcome, retry_at) = self.resync_on_loop(&table, retry_at).await;
                let _ = reply.send(outcome);
                retry_at
            }
            Command::Drain { reply } => {
                let (outcome, retry_at) = self.drain_on_loop(retry_at).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
                retry_at
            }
        }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.control.send(command).map_err(|_| SyncError::Shutdown)
    }

    async fn handle_transport_event(
        &self,
        event: TransportEvent,
        retry_at: Option<Instant>,
    ) -> Option<Instant> {
        let signal = match event {
            TransportEvent::Change(raw) => {
                self.handle_change(&raw).await;
                return retry_at;
            }
            TransportEvent::Closed { reason } => {
                tracing::info!(reason = reason.as_deref().unwrap_or("none"), "Realtime connection closed");
                ConnectionSignal::TransportClosed
            }
            TransportEvent::Failed { message, fatal } => {
                tracing::warn!(error = %message, fatal, "Realtime connection failed");
                ConnectionSignal::TransportFailed { message, fatal }
            }
        };

        match self.monitor.signal(signal) {
            Some(t) if t.left_connected() => {
                self.transport.disconnect().await;
                self.retry_after_drop()
            }
            _ => retry_at,
        }
    }

    async fn connection_lost(&self, message: String) -> Option<Instant> {
        self.monitor.signal(ConnectionSignal::TransportFailed {
            message,
            fatal: false,
        });
        self.transport.disconnect().await;
        self.retry_after_drop()
    }

    /// One connect attempt. Returns when to try again, if at all.
    async fn connect(&self, sink: &TransportSink) -> Option<Instant> {
        if self.is_shut_down() || !self.monitor.is_online() {
            return None;
        }

        self.monitor.signal(ConnectionSignal::AttemptStarted);
        let attempt = self.monitor.status().reconnect_attempts;

        let opened = async {
            self.transport.connect(sink.clone()).await?;
            self.registry.resubscribe_all(self.transport.as_ref()).await
        }
        .await;

        if let Err(e) = opened {
            let delay = self.backoff.delay(attempt);
            tracing::warn!(
                attempt,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Realtime connection attempt failed"
            );
            self.transport.disconnect().await;
            self.monitor.signal(ConnectionSignal::TransportFailed {
                message: e.to_string(),
                fatal: false,
            });
            return Some(Instant::now() + delay);
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.monitor.signal(ConnectionSignal::TransportOpened);
        self.catch_up().await
    }

    /// Drain the offline queue, then resync every subscribed table.
    async fn catch_up(&self) -> Option<Instant> {
        match self.drain_on_loop(None).await {
            (Ok(DrainOutcome::Stopped { .. }), retry_at) => return retry_at,
            (Ok(_), _) => {}
            (Err(e), _) => tracing::error!(error = %e, "Offline queue drain failed"),
        }

        for table in self.registry.tables() {
            if let Err(e) = self.resync_connected(&table).await {
                tracing::warn!(table = %table, error = %e, "Resync after reconnect failed");
                return self.connection_lost(e.to_string()).await;
            }
        }

        None
    }

    async fn handle_change(&self, raw: &Value) {
        match self.registry.normalize(&self.catalog, raw) {
            Ok(Some(event)) => self.process_event(event).await,
            Ok(None) => tracing::debug!("Notification outside subscriptions, skipping"),
            Err(e) => tracing::warn!(error = %e, "Dropping invalid notification"),
        }
    }

    /// Mirror, persist, broadcast and derive, in that order.
    pub(crate) async fn process_event(&self, event: DomainEvent) {
        let applied = self.mirror.write().await.apply_event(&self.catalog, &event);
        match applied {
            Ok(outcome) => {
                tracing::debug!(table = %event.table, id = %outcome.id(), kind = %event.kind, "Mirror updated");
            }
            Err(e @ EngineError::OrderingConflict { .. }) => {
                tracing::warn!(error = %e, "Dropping stale event");
                return;
            }
            Err(e) => {
                tracing::warn!(table = %event.table, error = %e, "Event rejected by mirror");
                return;
            }
        }

        self.persist_table(&event.table).await;
        self.broadcast(&event);
        self.derive(&event).await;
    }

    fn broadcast(&self, event: &DomainEvent) {
        let Some(spec) = self.catalog.get(&event.table) else {
            return;
        };
        match serde_json::to_value(event) {
            Ok(payload) => {
                self.dispatcher.notify(&event.listener_event(spec), &payload);
            }
            Err(e) => tracing::error!("Failed to serialize event: {}", e),
        }
    }

    /// Write a table's mirror to the store. The mirror is a cache, so a
    /// failure is logged and otherwise ignored.
    async fn persist_table(&self, table: &str) {
        let Some(snapshot) = self.mirror.read().await.export_table(table) else {
            return;
        };

        let written = snapshot
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))
            .and_then(|json| self.store.set(&mirror_key(table), &json));

        if let Err(e) = written {
            tracing::warn!(table = %table, error = %e, "Failed to persist mirror");
        }
    }

    /// Run the derivation rules for an event and submit what they produce.
    ///
    /// Called after the listeners were notified rather than registered as
    /// one: listeners are synchronous, and deriving awaits the durable key
    /// set and the submission.
    async fn derive(&self, event: &DomainEvent) {
        let derivations = match self.deriver.prepare(event).await {
            Ok(derivations) => derivations,
            Err(e) => {
                tracing::error!(table = %event.table, error = %e, "Derivation blocked");
                return;
            }
        };

        for derivation in derivations {
            let key = derivation.key.clone();
            let operation = Operation::DeriveMutation {
                idempotency_key: derivation.key,
                mutation: derivation.mutation,
            };

            match self.submit_derived(operation).await {
                Ok(outcome) => {
                    tracing::info!(rule = %derivation.rule, key = %key, outcome = ?outcome, "Derived mutation submitted");
                }
                Err(e) => {
                    tracing::error!(rule = %derivation.rule, key = %key, error = %e, "Derived mutation lost, releasing key");
                    if let Err(e) = self.deriver.release(&key).await {
                        tracing::error!(key = %key, error = %e, "Failed to release derivation key");
                    }
                }
            }
        }
    }

    /// Validate and submit a mutation from UI code.
    ///
    /// Sends directly when connected with nothing queued ahead, else
    /// enqueues. A direct send holds the send-order lock, so a later
    /// submission waits for it instead of overtaking it.
    pub(crate) async fn submit_mutation(&self, mutation: Mutation) -> Result<SubmitOutcome> {
        self.catalog.validate_mutation(&mutation)?;
        if self.is_shut_down() {
            return Err(SyncError::Shutdown);
        }

        let operation = Operation::PushRecord { mutation };
        if !self.may_send_directly().await {
            return self.enqueue(operation).await;
        }

        let order = self.send_order.lock().await;
        let outcome = self.submit_ordered(operation).await;
        drop(order);

        // the loop may have queued derived work while the send was in flight
        if self.monitor.is_connected() && !self.queue.is_empty().await {
            let _ = self.control.send(Command::Drain { reply: None });
        }
        outcome
    }

    /// Submit from the event loop without ever waiting on the send-order
    /// lock. While a caller's direct send holds it the operation is queued
    /// and that caller requests the drain.
    async fn submit_derived(&self, operation: Operation) -> Result<SubmitOutcome> {
        if self.is_shut_down() {
            return Err(SyncError::Shutdown);
        }

        if let Ok(_order) = self.send_order.try_lock() {
            return self.submit_ordered(operation).await;
        }

        let outcome = self.enqueue(operation).await;
        // the sender may have finished before the entry landed
        if self.send_order.try_lock().is_ok() {
            let _ = self.control.send(Command::Drain { reply: None });
        }
        outcome
    }

    async fn may_send_directly(&self) -> bool {
        let queue = self.queue.lock().await;
        self.monitor.is_connected() && queue.is_empty() && !self.queue.is_draining()
    }

    /// Direct send or enqueue. Caller holds the send-order lock.
    async fn submit_ordered(&self, operation: Operation) -> Result<SubmitOutcome> {
        if let (true, Some(mutation)) = (self.may_send_directly().await, operation.mutation()) {
            let generation = self.generation.load(Ordering::SeqCst);
            match self.transport.send(mutation).await {
                Ok(()) => {
                    tracing::debug!(op = operation.name(), table = %mutation.table, "Mutation sent");
                    return Ok(SubmitOutcome::Sent);
                }
                Err(TransportError::Rejected(reason)) => {
                    return Err(TransportError::Rejected(reason).into());
                }
                Err(e) => {
                    tracing::warn!(op = operation.name(), error = %e, "Direct send failed, queueing");
                    let _ = self.control.send(Command::TransportLost {
                        generation,
                        message: e.to_string(),
                    });
                }
            }
        }

        self.enqueue(operation).await
    }

    async fn enqueue(&self, operation: Operation) -> Result<SubmitOutcome> {
        let entry = self.queue.enqueue(operation).await?;
        Ok(SubmitOutcome::Queued { id: entry.id })
    }

    /// Resync a table on the event loop, or queue the resync if offline.
    pub(crate) async fn resync_table(&self, table: &str) -> Result<ResyncOutcome> {
        if !self.catalog.contains(table) {
            return Err(SyncError::UnknownTable(table.to_string()));
        }
        if self.is_shut_down() {
            return Err(SyncError::Shutdown);
        }
        if !self.monitor.is_connected() {
            return self.queue_resync(table).await;
        }

        let (reply, outcome) = oneshot::channel();
        self.send_command(Command::Resync {
            table: table.to_string(),
            reply,
        })?;
        outcome.await.map_err(|_| SyncError::Shutdown)?
    }

    async fn resync_on_loop(
        &self,
        table: &str,
        retry_at: Option<Instant>,
    ) -> (Result<ResyncOutcome>, Option<Instant>) {
        if !self.monitor.is_connected() {
            return (self.queue_resync(table).await, retry_at);
        }

        match self.resync_connected(table).await {
            Ok(rows) => (Ok(ResyncOutcome::Synced { rows }), retry_at),
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Resync failed, queueing");
                let retry_at = self.connection_lost(e.to_string()).await;
                (self.queue_resync(table).await, retry_at)
            }
        }
    }

    async fn queue_resync(&self, table: &str) -> Result<ResyncOutcome> {
        let entry = self
            .queue
            .enqueue(Operation::SyncTable {
                table: table.to_string(),
            })
            .await?;
        Ok(ResyncOutcome::Queued { id: entry.id })
    }

    /// Fetch a table and replace its mirror.
    ///
    /// Rows are stamped with their own timestamp field when they have one and
    /// with zero otherwise, so any live change observed later wins over them.
    /// Derivation rules sourced on the table's inserts see every fetched row,
    /// which catches up on changes missed while disconnected.
    async fn resync_connected(&self, table: &str) -> std::result::Result<usize, TransportError> {
        let rows = self.transport.fetch_table(table).await?;
        let Some(spec) = self.catalog.get(table) else {
            return Ok(0);
        };

        let entries: Vec<(Value, EventStamp)> = rows
            .into_iter()
            .map(|row| {
                let at = spec
                    .entity_timestamp(&row)
                    .and_then(parse_timestamp)
                    .unwrap_or(0);
                (row, EventStamp::at(at))
            })
            .collect();

        let replaced = self
            .mirror
            .write()
            .await
            .replace_snapshot(&self.catalog, table, entries.clone());
        let stored = match replaced {
            Ok(outcome) => {
                for rejected in &outcome.rejected {
                    tracing::warn!(table = %table, error = %rejected, "Fetched row dropped");
                }
                outcome.stored
            }
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Resync rejected by mirror");
                return Ok(0);
            }
        };

        self.persist_table(table).await;
        tracing::info!(table = %table, rows = stored, "Table resynced");
        self.dispatcher.notify(
            &format!("{}_synced", table),
            &json!({ "table": table, "rows": stored }),
        );

        let derives_inserts = self
            .deriver
            .sources()
            .await
            .iter()
            .any(|(source, kind)| source == table && *kind == EventKind::Insert);
        if derives_inserts {
            for (row, stamp) in entries {
                if spec.entity_id(&row).is_ok() {
                    self.derive(&DomainEvent::new(table, EventKind::Insert, row, stamp))
                        .await;
                }
            }
        }

        Ok(stored)
    }

    /// Drain the queue on the event loop.
    ///
    /// Returns [`DrainOutcome::AlreadyDraining`] at once if a drain is
    /// running.
    pub(crate) async fn drain_queue(&self) -> Result<DrainOutcome> {
        if !self.monitor.is_connected() {
            return Ok(self.offline_drain().await);
        }
        if self.queue.is_draining() {
            return Ok(DrainOutcome::AlreadyDraining);
        }

        let (reply, outcome) = oneshot::channel();
        self.send_command(Command::Drain { reply: Some(reply) })?;
        outcome.await.map_err(|_| SyncError::Shutdown)?
    }

    /// Drain under the send-order lock. A stopped drain means the connection
    /// is gone.
    async fn drain_on_loop(
        &self,
        retry_at: Option<Instant>,
    ) -> (Result<DrainOutcome>, Option<Instant>) {
        if !self.monitor.is_connected() {
            return (Ok(self.offline_drain().await), retry_at);
        }

        let Ok(_order) = self.send_order.try_lock() else {
            // a direct send is in flight; its caller asks again when done
            return (Ok(DrainOutcome::AlreadyDraining), retry_at);
        };

        let outcome = self.queue.drain(self).await;
        let retry_at = match &outcome {
            Ok(DrainOutcome::Stopped { error, .. }) => self.connection_lost(error.to_string()).await,
            _ => retry_at,
        };
        (outcome, retry_at)
    }

    async fn offline_drain(&self) -> DrainOutcome {
        DrainOutcome::Stopped {
            sent: 0,
            dropped: 0,
            remaining: self.queue.len().await,
            error: TransportError::ConnectionClosed,
        }
    }
}

impl OperationExecutor for Shared {
    fn execute<'a>(
        &'a self,
        op: &'a QueuedOperation,
    ) -> BoxFuture<'a, std::result::Result<(), TransportError>> {
        Box::pin(async move {
            match &op.operation {
                Operation::SyncTable { table } => self.resync_connected(table).await.map(|_| ()),
                Operation::PushRecord { mutation } | Operation::DeriveMutation { mutation, .. } => {
                    self.transport.send(mutation).await
                }
            }
        })
    }
}
