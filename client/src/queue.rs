//! Durable offline operation queue.
//!
//! Wraps the engine's [`OperationQueue`] with persistence and the drain loop.
//! The durable copy is rewritten on every enqueue and every acknowledgement;
//! an entry leaves it only after its send was confirmed, so a crash mid-drain
//! re-sends the in-flight entry on restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tillsync_engine::{Operation, OperationQueue, QueuedOperation};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Result, SyncError};
use crate::store::{DurableStore, StoreError, QUEUE_KEY};
use crate::transport::TransportError;

/// Carries out one queued operation against the remote service.
pub trait OperationExecutor: Send + Sync {
    /// Execute and wait for confirmation.
    fn execute<'a>(
        &'a self,
        op: &'a QueuedOperation,
    ) -> BoxFuture<'a, std::result::Result<(), TransportError>>;
}

/// Result of a drain call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue was emptied; `dropped` counts entries the backend rejected
    Completed { sent: usize, dropped: usize },
    /// A send failed; the failed entry is still at the front
    Stopped {
        sent: usize,
        dropped: usize,
        remaining: usize,
        error: TransportError,
    },
    /// Another drain, or a direct send, is in progress; this call did nothing
    AlreadyDraining,
}

/// FIFO of operations waiting for connectivity, persisted on every change.
pub struct DurableQueue {
    queue: Mutex<OperationQueue>,
    draining: AtomicBool,
    store: Arc<dyn DurableStore>,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("draining", &self.draining.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Clears the draining flag however the drain ends, including cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl DrainGuard<'_> {
    /// Clear the flag now, while the caller still holds the queue lock.
    fn release(self) {
        self.0.store(false, Ordering::SeqCst);
        std::mem::forget(self);
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl DurableQueue {
    /// Load the queue from the store, or start empty.
    ///
    /// An unreadable document is a persistence failure: starting empty would
    /// silently drop queued work.
    pub fn load(store: Arc<dyn DurableStore>) -> Result<Self> {
        let queue = match store.get(QUEUE_KEY)? {
            Some(json) => OperationQueue::from_json(&json)
                .map_err(|e| SyncError::Persistence(StoreError::Serialization(e.to_string())))?,
            None => OperationQueue::new(),
        };

        if !queue.is_empty() {
            tracing::info!(pending = queue.len(), "Restored offline queue");
        }

        Ok(Self {
            queue: Mutex::new(queue),
            draining: AtomicBool::new(false),
            store,
        })
    }

    fn persist(&self, queue: &OperationQueue) -> std::result::Result<(), StoreError> {
        let json = queue
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.store.set(QUEUE_KEY, &json)
    }

    /// Lock the queue to check its state against the draining flag.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, OperationQueue> {
        self.queue.lock().await
    }

    /// Whether a drain is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Append an operation and persist.
    pub async fn enqueue(&self, operation: Operation) -> Result<QueuedOperation> {
        let mut queue = self.queue.lock().await;
        self.enqueue_locked(&mut queue, operation)
    }

    /// If the durable write fails the entry is taken back out and the error
    /// returned, so the caller never believes unsaved work is queued.
    fn enqueue_locked(
        &self,
        queue: &mut OperationQueue,
        operation: Operation,
    ) -> Result<QueuedOperation> {
        let entry = QueuedOperation::new(
            uuid::Uuid::new_v4().to_string(),
            operation,
            crate::now_ms(),
        );
        queue.push(entry.clone());

        if let Err(e) = self.persist(queue) {
            let mut restored = OperationQueue::new();
            for op in queue.iter().filter(|op| op.id != entry.id) {
                restored.push(op.clone());
            }
            *queue = restored;
            tracing::error!(op = entry.operation.name(), error = %e, "Failed to persist queued operation");
            return Err(e.into());
        }

        tracing::debug!(
            op_id = %entry.id,
            op = entry.operation.name(),
            table = %entry.operation.table(),
            pending = queue.len(),
            "Operation queued"
        );
        Ok(entry)
    }

    /// Number of queued operations.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Check if nothing is queued.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Copy of the queued operations, in replay order.
    pub async fn pending(&self) -> Vec<QueuedOperation> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Send queued operations in FIFO order until the queue is empty or a
    /// send fails.
    ///
    /// Each entry is acknowledged and persisted only after `executor`
    /// confirmed it. A failed entry stays at the front. An entry the backend
    /// rejected outright can never succeed; it is dropped with an error log.
    /// A second call while a drain is running returns
    /// [`DrainOutcome::AlreadyDraining`].
    pub async fn drain(&self, executor: &dyn OperationExecutor) -> Result<DrainOutcome> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return Ok(DrainOutcome::AlreadyDraining);
        }
        let guard = DrainGuard(&self.draining);

        let mut sent = 0;
        let mut dropped = 0;
        loop {
            let next = {
                let queue = self.queue.lock().await;
                match queue.front() {
                    Some(op) => op.clone(),
                    None => {
                        // a submit that saw the flag has already enqueued
                        guard.release();
                        if sent > 0 || dropped > 0 {
                            tracing::info!(sent, dropped, "Offline queue drained");
                        }
                        return Ok(DrainOutcome::Completed { sent, dropped });
                    }
                }
            };

            match executor.execute(&next).await {
                Ok(()) => {
                    sent += 1;
                    tracing::debug!(op_id = %next.id, op = next.operation.name(), "Queued operation sent");
                }
                Err(TransportError::Rejected(reason)) => {
                    dropped += 1;
                    tracing::error!(
                        op_id = %next.id,
                        op = next.operation.name(),
                        reason = %reason,
                        "Queued operation rejected by backend, dropping"
                    );
                }
                Err(error) => {
                    let remaining = self.queue.lock().await.len();
                    tracing::warn!(
                        op_id = %next.id,
                        op = next.operation.name(),
                        error = %error,
                        remaining,
                        "Queued operation failed, draining stopped"
                    );
                    return Ok(DrainOutcome::Stopped {
                        sent,
                        dropped,
                        remaining,
                        error,
                    });
                }
            }

            let mut queue = self.queue.lock().await;
            if let Some(done) = queue.acknowledge(&next.id) {
                if let Err(e) = self.persist(&queue) {
                    queue.restore_front(done);
                    tracing::error!(op_id = %next.id, error = %e, "Failed to persist queue acknowledgement");
                    return Err(e.into());
                }
            }
        }
    }
}
