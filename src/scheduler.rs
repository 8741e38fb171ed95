//! Batch formation and concurrent dispatch.
//!
//! A single timer-driven loop decides what runs; members of a formed batch
//! execute concurrently and resolve independently. Selection order is
//! deterministic (priority sorter), completion order across batch members is
//! not. Cross-batch concurrency is bounded by the in-flight ceiling.

use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::events::{EventPublisher, SyncEvent};
use crate::executor::ExecutorRegistry;
use crate::network::NetworkMonitor;
use crate::operation::{ExecutionResult, FailureReason, Operation, OperationPriority};
use crate::queue::OperationQueue;
use crate::retry::{RetryDecision, RetryManager};

/// Ephemeral grouping of operations dispatched together.
///
/// A batch owns no persistent identity; it is discarded once every member
/// reaches a terminal or re-queued state.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub operations: Vec<Operation>,
}

impl Batch {
    fn new(operations: Vec<Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operations,
        }
    }

    /// Aggregate priority: the highest member priority.
    pub fn priority(&self) -> OperationPriority {
        self.operations
            .iter()
            .map(|op| op.priority)
            .max_by(|a, b| {
                a.weight()
                    .partial_cmp(&b.weight())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(OperationPriority::Normal)
    }

    /// Estimated total execution time from member hints, for budgeting.
    pub fn estimated_total_ms(&self) -> u64 {
        self.operations
            .iter()
            .filter_map(|op| op.estimated_duration_ms)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Periodically selects eligible operations into batches and dispatches
/// them through the executor registry.
pub struct BatchScheduler {
    queue: Arc<OperationQueue>,
    registry: Arc<ExecutorRegistry>,
    retry: RetryManager,
    network: Arc<NetworkMonitor>,
    publisher: EventPublisher,
    batch_size: usize,
    tick_interval: Duration,
    max_concurrent_batches: usize,
    in_flight: AtomicUsize,
    trigger: Notify,
}

/// Releases the scheduler's concurrency slot when the owning batch task
/// finishes, whether it returns or unwinds.
struct InFlightSlot(Arc<BatchScheduler>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<OperationQueue>,
        registry: Arc<ExecutorRegistry>,
        retry: RetryManager,
        network: Arc<NetworkMonitor>,
        publisher: EventPublisher,
        batch_size: usize,
        tick_interval: Duration,
        max_concurrent_batches: usize,
    ) -> Self {
        Self {
            queue,
            registry,
            retry,
            network,
            publisher,
            batch_size,
            tick_interval,
            max_concurrent_batches,
            in_flight: AtomicUsize::new(0),
            trigger: Notify::new(),
        }
    }

    /// Request an immediate scheduling pass (critical-priority enqueue).
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    /// Batches currently in progress.
    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// One scheduling pass: gate on connectivity and the in-flight ceiling,
    /// claim a batch, and dispatch it on a background task.
    pub async fn tick(self: Arc<Self>) {
        if self.network.is_offline() {
            debug!("Scheduler tick skipped, network offline");
            return;
        }
        if self.in_flight.load(Ordering::SeqCst) >= self.max_concurrent_batches {
            debug!(
                in_flight = self.in_flight.load(Ordering::SeqCst),
                ceiling = self.max_concurrent_batches,
                "Scheduler tick deferred, batch concurrency ceiling reached"
            );
            return;
        }

        let claimed = self.queue.claim_batch(self.batch_size, Utc::now()).await;
        if claimed.is_empty() {
            return;
        }

        let batch = Batch::new(claimed);
        info!(
            batch_id = %batch.id,
            size = batch.len(),
            priority = %batch.priority(),
            estimated_total_ms = batch.estimated_total_ms(),
            "Batch formed"
        );

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let slot = InFlightSlot(Arc::clone(&self));
        let scheduler = Arc::clone(&self);
        tokio::spawn(async move {
            let _slot = slot;
            scheduler.execute_batch(batch).await;
        });
    }

    /// Dispatch all batch members concurrently and resolve each result
    /// independently; one member's failure never aborts the others.
    async fn execute_batch(&self, batch: Batch) {
        self.publisher.publish(SyncEvent::BatchStarted {
            batch_id: batch.id,
            operation_ids: batch.operations.iter().map(|op| op.id).collect(),
        });

        let attempts = batch.operations.iter().map(|op| {
            self.publisher.publish(SyncEvent::OperationStarted {
                operation_id: op.id,
                batch_id: batch.id,
            });
            async move { (op, self.registry.execute(op).await) }
        });
        let outcomes = join_all(attempts).await;

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for (op, outcome) in outcomes {
            let result = outcome.unwrap_or_else(|resolve_error| {
                // Unregistered executor: record the attempt as failed so the
                // operation follows the normal retry path instead of
                // poisoning the loop.
                error!(
                    operation_id = %op.id,
                    op_type = %op.op_type,
                    error = %resolve_error,
                    "Executor resolution failed"
                );
                ExecutionResult::failure(op.id, 0, resolve_error.to_string())
            });

            if result.success {
                succeeded += 1;
                if let Err(error) = self.queue.complete(result).await {
                    error!(operation_id = %op.id, %error, "Failed to record completion");
                }
            } else {
                failed += 1;
                self.resolve_failure(op, result).await;
            }
        }

        info!(
            batch_id = %batch.id,
            succeeded,
            failed,
            "Batch completed"
        );
        self.publisher.publish(SyncEvent::BatchCompleted {
            batch_id: batch.id,
            succeeded,
            failed,
        });
    }

    async fn resolve_failure(&self, op: &Operation, result: ExecutionResult) {
        let multiplier = self.network.quality().delay_multiplier();
        let handoff = match self.retry.on_failure(op, multiplier, Utc::now()) {
            RetryDecision::Retry {
                retry_count,
                next_attempt_at,
                ..
            } => {
                self.queue
                    .schedule_retry(result, retry_count, next_attempt_at)
                    .await
            }
            RetryDecision::GiveUp => {
                self.queue
                    .fail_permanent(op.id, FailureReason::RetriesExhausted, Some(result))
                    .await
            }
        };
        if let Err(error) = handoff {
            error!(operation_id = %op.id, %error, "Failed to record failure outcome");
        }
    }

    /// Scheduling loop: periodic ticks plus immediate triggers, until the
    /// shutdown signal flips. In-flight batches run to completion on their
    /// own tasks.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => Arc::clone(&self).tick().await,
                _ = self.trigger.notified() => Arc::clone(&self).tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Batch scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::executor::{ExecutionOutcome, OperationExecutor};
    use crate::network::StaticProbe;
    use crate::operation::{OperationSpec, OperationStatus};
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingExecutor {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingExecutor {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl OperationExecutor for CountingExecutor {
        async fn execute(&self, _operation: &Operation) -> ExecutionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                ExecutionOutcome::failed("remote 503")
            } else {
                ExecutionOutcome::ok()
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl OperationExecutor for PanickingExecutor {
        async fn execute(&self, _operation: &Operation) -> ExecutionOutcome {
            panic!("handler bug")
        }
    }

    struct Harness {
        scheduler: Arc<BatchScheduler>,
        queue: Arc<OperationQueue>,
        probe: Arc<StaticProbe>,
        network: Arc<NetworkMonitor>,
    }

    fn harness(executor: Arc<dyn OperationExecutor>, retry_intervals: &[u64]) -> Harness {
        let publisher = EventPublisher::new(256);
        let queue = Arc::new(OperationQueue::new(
            Arc::new(MemoryStore::new()),
            publisher.clone(),
            100,
            50,
            2,
        ));
        let registry = Arc::new(ExecutorRegistry::new(Duration::from_secs(1)));
        registry.register_type("payment", executor);
        let probe = Arc::new(StaticProbe::new(Some(Duration::from_millis(10))));
        let network = Arc::new(NetworkMonitor::new(
            probe.clone(),
            publisher.clone(),
            Duration::from_secs(60),
            Duration::from_millis(100),
        ));
        let scheduler = Arc::new(BatchScheduler::new(
            queue.clone(),
            registry,
            RetryManager::new(retry_intervals),
            network.clone(),
            publisher,
            10,
            Duration::from_secs(60),
            2,
        ));
        Harness {
            scheduler,
            queue,
            probe,
            network,
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn test_tick_executes_pending_operation() {
        let h = harness(CountingExecutor::new(false), &[10]);
        let id = h
            .queue
            .enqueue(OperationSpec::new("payment", "card"))
            .await
            .unwrap();

        h.scheduler.clone().tick().await;
        wait_for(|| async {
            h.queue.get(id).await.unwrap().status == OperationStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn test_offline_gates_batch_formation() {
        let h = harness(CountingExecutor::new(false), &[10]);
        h.probe.set_latency(None);
        h.network.check_now().await;

        let id = h
            .queue
            .enqueue(OperationSpec::new("payment", "card"))
            .await
            .unwrap();
        h.scheduler.clone().tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.queue.get(id).await.unwrap().status,
            OperationStatus::Pending
        );

        // Back online, scheduling resumes on the next tick.
        h.probe.set_latency(Some(Duration::from_millis(10)));
        h.network.check_now().await;
        h.scheduler.clone().tick().await;
        wait_for(|| async {
            h.queue.get(id).await.unwrap().status == OperationStatus::Completed
        })
        .await;
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_then_exhausts_budget() {
        let executor = CountingExecutor::new(true);
        let h = harness(executor.clone(), &[10, 20]);
        let id = h
            .queue
            .enqueue(OperationSpec::new("payment", "card").with_max_retries(2))
            .await
            .unwrap();

        h.scheduler.clone().tick().await;
        wait_for(|| async { h.queue.get(id).await.unwrap().retry_count == 1 }).await;
        let op = h.queue.get(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.next_attempt_at.is_some());

        // Keep ticking until the budget is exhausted.
        for _ in 0..200 {
            h.scheduler.clone().tick().await;
            if h.queue.get(id).await.unwrap().status == OperationStatus::FailedPermanent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let op = h.queue.get(id).await.unwrap();
        assert_eq!(op.status, OperationStatus::FailedPermanent);
        assert_eq!(op.failure_reason, Some(FailureReason::RetriesExhausted));
        // Initial attempt plus two retries, never a fourth call.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_type_takes_retry_path() {
        let h = harness(CountingExecutor::new(false), &[10]);
        let id = h
            .queue
            .enqueue(OperationSpec::new("unknown", "x").with_max_retries(0))
            .await
            .unwrap();

        h.scheduler.clone().tick().await;
        wait_for(|| async {
            h.queue.get(id).await.unwrap().status == OperationStatus::FailedPermanent
        })
        .await;
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_operation_and_frees_slot() {
        let h = harness(Arc::new(PanickingExecutor), &[10]);
        let id = h
            .queue
            .enqueue(OperationSpec::new("payment", "card").with_max_retries(0))
            .await
            .unwrap();

        h.scheduler.clone().tick().await;
        wait_for(|| async {
            h.queue.get(id).await.unwrap().status == OperationStatus::FailedPermanent
        })
        .await;
        // The concurrency slot is released, not leaked by the unwind.
        wait_for(|| async { h.scheduler.in_flight_batches() == 0 }).await;
    }

    #[tokio::test]
    async fn test_batch_priority_is_max_of_members() {
        let low = Operation::from_spec(
            OperationSpec::new("a", "").with_priority(OperationPriority::Low),
            1,
        );
        let high = Operation::from_spec(
            OperationSpec::new("b", "").with_priority(OperationPriority::High),
            1,
        );
        let batch = Batch::new(vec![low, high]);
        assert_eq!(batch.priority(), OperationPriority::High);
    }
}
