//! Durable offline operation queue
//!
//! Operations are persisted before `enqueue` returns and replayed by
//! priority, then insertion order. Failures are rescheduled with exponential
//! backoff; operations that exhaust their retry budget move to the dead-letter
//! table.

mod handler;
mod operation;
mod worker;

pub use handler::{BackendOperationHandler, OperationHandler, OperationHandlers};
pub use operation::{priority, DeadLetter, OfflineOperation, OperationType};
pub use worker::{QueueCommand, QueueWorker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::retry::Backoff;
use crate::storage::OperationStore;
use crate::types::QueueConfig;

/// Outcome of one `process_queue` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRunReport {
    /// Another run was active; this call did nothing
    pub coalesced: bool,
    /// The run stopped early because it was cancelled
    pub interrupted: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Clears the busy flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OfflineQueue {
    store: Arc<dyn OperationStore>,
    handlers: OperationHandlers,
    backoff: Backoff,
    max_retries: u32,
    processing: AtomicBool,
    cancel: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl OfflineQueue {
    pub fn new(
        store: Arc<dyn OperationStore>,
        handlers: OperationHandlers,
        config: &QueueConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            backoff: Backoff::from_millis(config.retry_base_ms, config.retry_max_ms),
            max_retries: config.max_retries,
            processing: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            last_error: RwLock::new(None),
        }
    }

    /// Persist an operation; it is durable once this returns `Ok`
    pub fn enqueue(&self, op: OfflineOperation) -> Result<Uuid> {
        self.store.save_operation(&op)?;
        tracing::info!(
            id = %op.id,
            operation_type = %op.operation_type,
            priority = op.priority,
            "Queued offline operation"
        );
        Ok(op.id)
    }

    /// Replay every due operation once
    pub async fn process_queue(&self) -> Result<QueueRunReport> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Queue run already active, coalescing");
            return Ok(QueueRunReport {
                coalesced: true,
                ..Default::default()
            });
        }
        let _guard = RunGuard(&self.processing);
        self.cancel.store(false, Ordering::SeqCst);

        let due = self.store.due_operations(Utc::now())?;
        let mut report = QueueRunReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        tracing::info!(count = due.len(), "Processing offline queue");

        for mut op in due {
            if self.cancel.load(Ordering::SeqCst) {
                report.interrupted = true;
                break;
            }

            let result = self.handlers.dispatch(&op).await;

            if self.cancel.load(Ordering::SeqCst) {
                // Result of a call that raced with cancellation is dropped
                report.interrupted = true;
                break;
            }

            match result {
                Ok(()) => {
                    self.store.delete_operation(op.id)?;
                    report.succeeded += 1;
                    tracing::debug!(id = %op.id, "Offline operation applied");
                }
                Err(e) => {
                    let now = Utc::now();
                    let message = e.to_string();
                    op.retry_count += 1;
                    op.last_attempt_at = Some(now);
                    op.last_error = Some(message.clone());

                    if op.retry_count > self.max_retries {
                        self.store.dead_letter(&op, &message)?;
                        report.dead_lettered += 1;
                        tracing::error!(
                            id = %op.id,
                            operation_type = %op.operation_type,
                            retries = op.retry_count,
                            "Offline operation dead-lettered: {}",
                            message
                        );
                        *self.last_error.write() = Some(format!(
                            "{} operation failed permanently: {}",
                            op.operation_type, message
                        ));
                    } else {
                        let delay = self.backoff.delay(op.retry_count - 1);
                        let delay = chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                        op.next_attempt_at = Some(now + delay);
                        self.store.save_operation(&op)?;
                        report.failed += 1;
                        tracing::warn!(
                            id = %op.id,
                            retry_count = op.retry_count,
                            "Offline operation failed, rescheduled: {}",
                            message
                        );
                    }
                }
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "Offline queue run finished"
        );
        Ok(report)
    }

    /// Stop the active run after the operation in flight
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn clear_queue(&self) -> Result<usize> {
        let removed = self.store.clear_operations()?;
        tracing::info!(removed, "Cleared offline queue");
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        self.store.count_operations()
    }

    /// Queued operations in processing order
    pub fn pending(&self) -> Result<Vec<OfflineOperation>> {
        self.store.all_operations()
    }

    pub fn remove(&self, id: Uuid) -> Result<bool> {
        self.store.delete_operation(id)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.dead_letters()
    }

    pub fn dead_letter_count(&self) -> Result<usize> {
        self.store.count_dead_letters()
    }

    /// Give a dead-lettered operation a fresh retry budget
    pub fn requeue_dead_letter(&self, id: Uuid) -> Result<OfflineOperation> {
        let op = self.store.requeue_dead_letter(id)?;
        tracing::info!(id = %id, "Requeued dead-lettered operation");
        Ok(op)
    }

    /// Most recent permanent failure
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Fails each operation a configured number of times, records calls
    #[derive(Default)]
    struct FlakyHandler {
        failures: Mutex<HashMap<Uuid, u32>>,
        calls: Mutex<Vec<(Uuid, u32)>>,
    }

    impl FlakyHandler {
        fn fail(&self, id: Uuid, times: u32) {
            self.failures.lock().insert(id, times);
        }
    }

    #[async_trait]
    impl OperationHandler for FlakyHandler {
        async fn handle(&self, op: &OfflineOperation) -> Result<()> {
            self.calls.lock().push((op.id, op.retry_count));
            let mut failures = self.failures.lock();
            match failures.get_mut(&op.id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(SyncError::from_status(503, "unavailable"))
                }
                _ => Ok(()),
            }
        }
    }

    fn config(max_retries: u32) -> QueueConfig {
        QueueConfig {
            max_retries,
            retry_base_ms: 0,
            retry_max_ms: 0,
            ..Default::default()
        }
    }

    fn queue(handler: Arc<FlakyHandler>, max_retries: u32) -> OfflineQueue {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        OfflineQueue::new(storage, OperationHandlers::uniform(handler), &config(max_retries))
    }

    fn op(priority: i32) -> OfflineOperation {
        OfflineOperation::new(OperationType::MetricUpload, b"{}".to_vec()).with_priority(priority)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let handler = Arc::new(FlakyHandler::default());
        let queue = queue(handler.clone(), 5);

        let a = queue.enqueue(op(10)).unwrap();
        let b = queue.enqueue(op(0)).unwrap();
        let c = queue.enqueue(op(10)).unwrap();

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.succeeded, 3);
        let order: Vec<Uuid> = handler.calls.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![b, a, c]);
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_ops() {
        let handler = Arc::new(FlakyHandler::default());
        let queue = queue(handler.clone(), 5);

        let a = queue.enqueue(op(0)).unwrap();
        let b = queue.enqueue(op(1)).unwrap();
        handler.fail(a, 1);

        let report = queue.process_queue().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);

        let remaining = queue.pending().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, a);
        assert_eq!(remaining[0].retry_count, 1);
        assert!(remaining[0].last_error.is_some());
        assert!(remaining[0].last_attempt_at.is_some());
        assert!(!remaining.iter().any(|o| o.id == b));
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_retries() {
        let handler = Arc::new(FlakyHandler::default());
        let queue = queue(handler.clone(), 2);
        let id = queue.enqueue(op(0)).unwrap();
        handler.fail(id, u32::MAX);

        let mut reports = Vec::new();
        for _ in 0..3 {
            reports.push(queue.process_queue().await.unwrap());
        }

        assert_eq!(reports[0].failed, 1);
        assert_eq!(reports[1].failed, 1);
        assert_eq!(reports[2].dead_lettered, 1);
        assert_eq!(queue.count().unwrap(), 0);

        let letters = queue.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].operation.retry_count, 3);
        assert!(queue.last_error().unwrap().contains("metric_upload"));

        // Nothing left to do until the letter is requeued
        assert_eq!(queue.process_queue().await.unwrap(), QueueRunReport::default());
        queue.requeue_dead_letter(id).unwrap();
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_backoff_defers_next_attempt() {
        let handler = Arc::new(FlakyHandler::default());
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let queue = OfflineQueue::new(
            storage,
            OperationHandlers::uniform(handler.clone()),
            &QueueConfig::default(),
        );
        let id = queue.enqueue(op(0)).unwrap();
        handler.fail(id, 1);

        queue.process_queue().await.unwrap();
        // Rescheduled 5s out, so an immediate second run finds nothing due
        let report = queue.process_queue().await.unwrap();
        assert_eq!(report, QueueRunReport::default());
        assert_eq!(handler.calls.lock().len(), 1);

        let pending = queue.pending().unwrap();
        assert!(pending[0].next_attempt_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_clear_and_remove() {
        let handler = Arc::new(FlakyHandler::default());
        let queue = queue(handler, 5);
        let a = queue.enqueue(op(0)).unwrap();
        queue.enqueue(op(0)).unwrap();
        queue.enqueue(op(0)).unwrap();

        assert!(queue.remove(a).unwrap());
        assert_eq!(queue.count().unwrap(), 2);
        assert_eq!(queue.clear_queue().unwrap(), 2);
        assert_eq!(queue.count().unwrap(), 0);
    }

    /// Blocks until released so a second run can observe the first
    struct GateHandler {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl OperationHandler for GateHandler {
        async fn handle(&self, _op: &OfflineOperation) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reentrant_run_is_coalesced() {
        let gate = Arc::new(GateHandler {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let queue = Arc::new(OfflineQueue::new(
            storage,
            OperationHandlers::uniform(gate.clone()),
            &config(5),
        ));
        queue.enqueue(op(0)).unwrap();

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.process_queue().await })
        };
        gate.entered.notified().await;

        let second = queue.process_queue().await.unwrap();
        assert!(second.coalesced);
        assert!(queue.is_processing());

        gate.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.succeeded, 1);
        assert!(!queue.is_processing());
    }
}
