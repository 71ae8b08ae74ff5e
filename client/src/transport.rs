//! Transport abstraction for the remote change-notification service.
//!
//! The engine needs two capabilities from the backend: a mutation API and a
//! subscribe-by-table change feed. [`RealtimeTransport`] is that seam; any
//! provider offering both can be plugged in. [`MemoryTransport`] is an
//! in-process backend used by tests and local demos.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures::future::BoxFuture;
use serde_json::Value;
use tillsync_engine::{EventKind, Mutation, MutationAction, TableName};
use tokio::sync::{mpsc, watch, Mutex};

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed at the network layer.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The backend refused the mutation.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// Subscription handshake failed.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Full-table fetch failed.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Signals pushed by a connected transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A raw change notification
    Change(Value),
    /// The connection closed
    Closed { reason: Option<String> },
    /// The connection failed; `fatal` marks errors that are not plain disconnects
    Failed { message: String, fatal: bool },
}

/// Channel a transport pushes its events into.
pub type TransportSink = mpsc::UnboundedSender<TransportEvent>;

/// Realtime backend capability.
pub trait RealtimeTransport: Send + Sync {
    /// Whether realtime is usable at all in this environment.
    ///
    /// Checked once when the engine is built; `false` yields a disabled engine.
    fn is_available(&self) -> bool {
        true
    }

    /// Open the connection. Inbound events go to `sink` until it closes.
    fn connect(&self, sink: TransportSink) -> BoxFuture<'_, TransportResult<()>>;

    /// Start the change feed for one table.
    fn subscribe<'a>(
        &'a self,
        table: &'a str,
        kinds: &'a [EventKind],
    ) -> BoxFuture<'a, TransportResult<()>>;

    /// Stop the change feed for one table.
    fn unsubscribe<'a>(&'a self, table: &'a str) -> BoxFuture<'a, TransportResult<()>>;

    /// Send a mutation and wait for the backend's confirmation.
    fn send<'a>(&'a self, mutation: &'a Mutation) -> BoxFuture<'a, TransportResult<()>>;

    /// Fetch every row of a table.
    fn fetch_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, TransportResult<Vec<Value>>>;

    /// Close the connection. Closing twice is harmless.
    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// In-process backend.
///
/// Keeps tables in memory, applies sent mutations to them (upserts are keyed
/// by `id`) and echoes every applied mutation as a change notification on
/// subscribed tables, the way a hosted backend would.
#[derive(Debug)]
pub struct MemoryTransport {
    available: bool,
    reachable: AtomicBool,
    fail_sends: AtomicUsize,
    hold: watch::Sender<bool>,
    pass_sends: AtomicUsize,
    hold_fetch: watch::Sender<bool>,
    fetches: AtomicUsize,
    connects: AtomicUsize,
    seq: AtomicU64,
    sink: Mutex<Option<TransportSink>>,
    subscriptions: Mutex<BTreeMap<TableName, Vec<EventKind>>>,
    tables: Mutex<HashMap<TableName, Vec<Value>>>,
    attempted: Mutex<Vec<Mutation>>,
    sent: Mutex<Vec<Mutation>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// A reachable backend with no tables.
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        let (hold_fetch, _) = watch::channel(false);
        Self {
            available: true,
            reachable: AtomicBool::new(true),
            fail_sends: AtomicUsize::new(0),
            hold,
            pass_sends: AtomicUsize::new(0),
            hold_fetch,
            fetches: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            sink: Mutex::new(None),
            subscriptions: Mutex::new(BTreeMap::new()),
            tables: Mutex::new(HashMap::new()),
            attempted: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A backend that reports realtime as unavailable.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Make connection attempts succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` sends with [`TransportError::SendFailed`].
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// While held, sends are recorded as attempted and then wait.
    pub fn hold_sends(&self, hold: bool) {
        self.pass_sends.store(0, Ordering::SeqCst);
        self.hold.send_replace(hold);
    }

    /// Let the next `n` sends through, then hold every later one until
    /// `hold_sends(false)`.
    pub fn hold_sends_after(&self, n: usize) {
        self.pass_sends.store(n, Ordering::SeqCst);
        self.hold.send_replace(true);
    }

    /// While held, table fetches are counted and then wait.
    pub fn hold_fetches(&self, hold: bool) {
        self.hold_fetch.send_replace(hold);
    }

    /// Number of table fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Replace the rows of a table.
    pub async fn set_table(&self, table: &str, rows: Vec<Value>) {
        self.tables.lock().await.insert(table.to_string(), rows);
    }

    /// Current rows of a table.
    pub async fn table_rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Push a raw notification to the connected engine.
    ///
    /// Returns `false` if nobody is connected.
    pub async fn emit(&self, notification: Value) -> bool {
        match self.sink.lock().await.as_ref() {
            Some(sink) => sink.send(TransportEvent::Change(notification)).is_ok(),
            None => false,
        }
    }

    /// Drop the connection from the backend side.
    pub async fn drop_connection(&self, reason: &str) {
        if let Some(sink) = self.sink.lock().await.take() {
            let _ = sink.send(TransportEvent::Closed {
                reason: Some(reason.to_string()),
            });
        }
        self.subscriptions.lock().await.clear();
    }

    /// Whether an engine is connected.
    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Tables with an active change feed.
    pub async fn subscribed_tables(&self) -> Vec<TableName> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    /// Every mutation a send was attempted for, in order.
    pub async fn attempted(&self) -> Vec<Mutation> {
        self.attempted.lock().await.clone()
    }

    /// Mutations the backend confirmed, in order.
    pub async fn sent(&self) -> Vec<Mutation> {
        self.sent.lock().await.clone()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a confirmed mutation to the stored table.
    ///
    /// Returns the notification to echo.
    async fn apply(&self, mutation: &Mutation) -> Option<Value> {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(mutation.table.clone()).or_default();

        let mut entity = mutation.payload.clone();
        if entity.get("id").map_or(true, Value::is_null) {
            if let Some(obj) = entity.as_object_mut() {
                obj.insert("id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
            }
        }
        let id = entity.get("id").cloned();
        let position = rows.iter().position(|r| r.get("id") == id.as_ref());

        let (event_type, new, old) = match (mutation.action, position) {
            (MutationAction::Delete, Some(i)) => {
                let old = rows.remove(i);
                ("DELETE", None, Some(old))
            }
            (MutationAction::Delete, None) => return None,
            (MutationAction::Update, Some(i)) | (MutationAction::Upsert, Some(i)) => {
                let old = rows[i].clone();
                if let (Some(target), Some(patch)) = (rows[i].as_object_mut(), entity.as_object()) {
                    for (k, v) in patch {
                        target.insert(k.clone(), v.clone());
                    }
                }
                ("UPDATE", Some(rows[i].clone()), Some(old))
            }
            (MutationAction::Update, None) => return None,
            (MutationAction::Insert, Some(_)) => return None,
            (MutationAction::Insert, None) | (MutationAction::Upsert, None) => {
                rows.push(entity.clone());
                ("INSERT", Some(entity), None)
            }
        };

        Some(serde_json::json!({
            "table": mutation.table,
            "eventType": event_type,
            "new": new,
            "old": old,
            "commitTimestamp": chrono::Utc::now().to_rfc3339(),
            "seq": self.next_seq(),
        }))
    }
}

impl RealtimeTransport for MemoryTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn connect(&self, sink: TransportSink) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionFailed("backend unreachable".into()));
            }
            *self.sink.lock().await = Some(sink);
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        table: &'a str,
        kinds: &'a [EventKind],
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            if self.sink.lock().await.is_none() {
                return Err(TransportError::SubscribeFailed("not connected".into()));
            }
            self.subscriptions
                .lock()
                .await
                .insert(table.to_string(), kinds.to_vec());
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, table: &'a str) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            self.subscriptions.lock().await.remove(table);
            Ok(())
        })
    }

    fn send<'a>(&'a self, mutation: &'a Mutation) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move {
            if self.sink.lock().await.is_none() {
                return Err(TransportError::ConnectionClosed);
            }
            self.attempted.lock().await.push(mutation.clone());

            let passes = self
                .pass_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let mut hold = self.hold.subscribe();
            if !passes && hold.wait_for(|held| !*held).await.is_err() {
                return Err(TransportError::ConnectionClosed);
            }

            let failing = self
                .fail_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(TransportError::SendFailed("injected failure".into()));
            }

            self.sent.lock().await.push(mutation.clone());
            let echo = self.apply(mutation).await;

            if let Some(notification) = echo {
                let watched = self
                    .subscriptions
                    .lock()
                    .await
                    .contains_key(&mutation.table);
                if watched {
                    if let Some(sink) = self.sink.lock().await.as_ref() {
                        let _ = sink.send(TransportEvent::Change(notification));
                    }
                }
            }

            Ok(())
        })
    }

    fn fetch_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, TransportResult<Vec<Value>>> {
        Box::pin(async move {
            if self.sink.lock().await.is_none() {
                return Err(TransportError::FetchFailed("not connected".into()));
            }
            // rows are read before waiting, like a response already on the wire
            let rows = self.table_rows(table).await;
            self.fetches.fetch_add(1, Ordering::SeqCst);

            let mut hold = self.hold_fetch.subscribe();
            if hold.wait_for(|held| !*held).await.is_err() {
                return Err(TransportError::FetchFailed("backend gone".into()));
            }
            Ok(rows)
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.sink.lock().await.take();
            self.subscriptions.lock().await.clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn connect_respects_reachability() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        transport.set_reachable(false);
        assert!(matches!(
            transport.connect(tx.clone()).await,
            Err(TransportError::ConnectionFailed(_))
        ));

        transport.set_reachable(true);
        transport.connect(tx).await.unwrap();
        assert!(transport.is_connected().await);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let transport = MemoryTransport::new();
        let mutation = Mutation::insert("sales", json!({"total": 1}));
        assert_eq!(
            transport.send(&mutation).await,
            Err(TransportError::ConnectionClosed)
        );
        assert!(transport.attempted().await.is_empty());
    }

    #[tokio::test]
    async fn send_applies_and_echoes() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport
            .subscribe("sales", &[EventKind::Insert])
            .await
            .unwrap();

        transport
            .send(&Mutation::insert("sales", json!({"id": "s1", "total": 3})))
            .await
            .unwrap();

        let rows = transport.table_rows("sales").await;
        assert_eq!(rows, vec![json!({"id": "s1", "total": 3})]);

        let Some(TransportEvent::Change(echo)) = rx.recv().await else {
            panic!("expected an echoed change");
        };
        assert_eq!(echo["table"], "sales");
        assert_eq!(echo["eventType"], "INSERT");
        assert_eq!(echo["new"]["id"], "s1");
        assert_eq!(echo["seq"], 1);
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_id() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        for amount in [1, 2] {
            transport
                .send(&Mutation::upsert(
                    "cash_movements",
                    json!({"id": "sale-1", "amount": amount}),
                ))
                .await
                .unwrap();
        }

        let rows = transport.table_rows("cash_movements").await;
        assert_eq!(rows, vec![json!({"id": "sale-1", "amount": 2})]);
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.fail_next_sends(1);

        let mutation = Mutation::insert("sales", json!({"total": 1}));
        assert!(matches!(
            transport.send(&mutation).await,
            Err(TransportError::SendFailed(_))
        ));
        transport.send(&mutation).await.unwrap();

        assert_eq!(transport.attempted().await.len(), 2);
        assert_eq!(transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn drop_connection_notifies_sink() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        transport.drop_connection("maintenance").await;
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed {
                reason: Some("maintenance".into())
            })
        );
        assert!(!transport.emit(json!({})).await);
    }

    #[tokio::test]
    async fn hold_after_lets_earlier_sends_through() {
        let transport = std::sync::Arc::new(MemoryTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.hold_sends_after(1);

        let first = Mutation::insert("sales", json!({"id": "a", "total": 1}));
        transport.send(&first).await.unwrap();

        let held = tokio::spawn({
            let transport = transport.clone();
            async move {
                let second = Mutation::insert("sales", json!({"id": "b", "total": 2}));
                transport.send(&second).await
            }
        });
        while transport.attempted().await.len() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.sent().await.len(), 1);

        transport.hold_sends(false);
        held.await.unwrap().unwrap();
        assert_eq!(transport.sent().await.len(), 2);
    }

    #[test]
    fn unavailable_backend() {
        assert!(!MemoryTransport::unavailable().is_available());
        assert!(MemoryTransport::new().is_available());
    }
}
