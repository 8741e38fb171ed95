//! The operation queue: single source of truth for operation state.
//!
//! All mutation is serialized through one async mutex so concurrent
//! producers and the scheduler never observe partial updates, and every
//! successful mutation is persisted before control returns to the caller
//! (write-ahead-then-acknowledge). If the store fails, the queue keeps
//! operating in memory and flags the degraded mode through an event until a
//! later save succeeds.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dependency;
use crate::error::{Result, SyncError};
use crate::events::{EventPublisher, SyncEvent};
use crate::operation::{
    ExecutionResult, FailureReason, Operation, OperationSpec, OperationStatus,
};
use crate::persistence::{PersistenceStore, QueueSnapshot};
use crate::priority;

struct QueueInner {
    operations: HashMap<Uuid, Operation>,
    results: HashMap<Uuid, ExecutionResult>,
    /// False after a failed save, until the next save succeeds.
    durable: bool,
}

impl QueueInner {
    fn pending_count(&self) -> usize {
        self.operations
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .count()
    }
}

/// Exclusive owner of all [`Operation`] records.
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    store: Arc<dyn PersistenceStore>,
    publisher: EventPublisher,
    max_queue_size: usize,
    result_retention: usize,
    default_max_retries: u32,
}

impl OperationQueue {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        publisher: EventPublisher,
        max_queue_size: usize,
        result_retention: usize,
        default_max_retries: u32,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                operations: HashMap::new(),
                results: HashMap::new(),
                durable: true,
            }),
            store,
            publisher,
            max_queue_size,
            result_retention,
            default_max_retries,
        }
    }

    /// Rebuild in-memory state from a startup snapshot.
    ///
    /// Operations found `executing` were interrupted mid-batch by a crash;
    /// they are reset to `pending` and become eligible for re-selection
    /// (at-least-once semantics, handlers tolerate duplicate effects).
    pub async fn restore(&self, snapshot: QueueSnapshot) {
        let mut inner = self.inner.lock().await;
        let mut recovered = 0usize;
        for mut op in snapshot.operations {
            if op.status == OperationStatus::Executing {
                op.status = OperationStatus::Pending;
                recovered += 1;
            }
            inner.operations.insert(op.id, op);
        }
        for result in snapshot.results {
            inner.results.insert(result.operation_id, result);
        }
        info!(
            operations = inner.operations.len(),
            results = inner.results.len(),
            recovered_executing = recovered,
            "Queue state restored from snapshot"
        );
    }

    /// Enqueue one operation. Fails synchronously on validation problems,
    /// dependency cycles, or a full queue.
    pub async fn enqueue(&self, spec: OperationSpec) -> Result<Uuid> {
        let ids = self.enqueue_all(vec![spec]).await?;
        Ok(ids[0])
    }

    /// Enqueue several operations atomically: if any spec fails validation,
    /// none are inserted.
    pub async fn enqueue_all(&self, specs: Vec<OperationSpec>) -> Result<Vec<Uuid>> {
        if specs.is_empty() {
            return Err(SyncError::Validation("empty operation batch".to_string()));
        }

        let mut inner = self.inner.lock().await;

        let pending = inner.pending_count();
        if pending + specs.len() > self.max_queue_size {
            return Err(SyncError::QueueFull {
                pending,
                limit: self.max_queue_size,
            });
        }

        // Validate everything before touching state (all-or-nothing).
        let mut operations = Vec::with_capacity(specs.len());
        for spec in specs {
            spec.validate()?;
            let op = Operation::from_spec(spec, self.default_max_retries);
            dependency::validate_acyclic(op.id, &op.dependencies, &inner.operations)?;
            operations.push(op);
        }

        let mut ids = Vec::with_capacity(operations.len());
        for op in operations {
            debug!(
                operation_id = %op.id,
                op_type = %op.op_type,
                subtype = %op.subtype,
                priority = %op.priority,
                "Operation enqueued"
            );
            ids.push(op.id);
            self.publisher
                .publish(SyncEvent::OperationQueued { operation: op.clone() });
            inner.operations.insert(op.id, op);
        }

        self.persist(&mut inner).await;
        Ok(ids)
    }

    /// Look up one operation by id.
    pub async fn get(&self, id: Uuid) -> Option<Operation> {
        self.inner.lock().await.operations.get(&id).cloned()
    }

    /// Cancel a pending operation. Returns `false` when the operation is
    /// unknown, already executing, or terminal; in-flight work is not
    /// preemptible.
    ///
    /// A cancelled operation never records a success, so its pending
    /// dependents can never become eligible; they are failed with
    /// `blocked_by_dependency`, the same cascade a permanent failure takes.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(op) = inner.operations.get_mut(&id) else {
            return false;
        };
        if op.status != OperationStatus::Pending {
            return false;
        }
        op.status = OperationStatus::Cancelled;
        info!(operation_id = %id, "Operation cancelled");
        self.publisher
            .publish(SyncEvent::OperationCancelled { operation_id: id });
        self.cascade_block(&mut inner, id);
        self.persist(&mut inner).await;
        true
    }

    /// All pending operations, unordered.
    pub async fn list_pending(&self) -> Vec<Operation> {
        self.inner
            .lock()
            .await
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending_count()
    }

    /// Atomically select up to `batch_size` eligible operations in priority
    /// order and flip them to `executing`.
    ///
    /// The selection and the status flip happen under one lock hold, so an
    /// operation can never be claimed by two concurrently forming batches.
    pub async fn claim_batch(&self, batch_size: usize, now: DateTime<Utc>) -> Vec<Operation> {
        let mut inner = self.inner.lock().await;

        let mut candidates: Vec<Operation> = inner
            .operations
            .values()
            .filter(|op| dependency::is_eligible(op, &inner.operations, &inner.results, now))
            .cloned()
            .collect();
        priority::sort_candidates(&mut candidates);
        candidates.truncate(batch_size);

        for claimed in &mut candidates {
            claimed.status = OperationStatus::Executing;
            claimed.last_attempt_at = Some(now);
            inner.operations.insert(claimed.id, claimed.clone());
        }

        if !candidates.is_empty() {
            self.persist(&mut inner).await;
        }
        candidates
    }

    /// Record a successful attempt and move the operation to `completed`.
    pub async fn complete(&self, result: ExecutionResult) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let id = result.operation_id;
        let op = inner
            .operations
            .get_mut(&id)
            .ok_or(SyncError::OperationNotFound(id))?;
        if op.status != OperationStatus::Executing {
            return Err(SyncError::StateTransition(format!(
                "operation {id} completed while {}",
                op.status
            )));
        }

        op.status = OperationStatus::Completed;
        debug!(operation_id = %id, duration_ms = result.duration_ms, "Operation completed");
        inner.results.insert(id, result.clone());
        self.publisher.publish(SyncEvent::OperationCompleted {
            operation_id: id,
            result,
        });

        self.prune(&mut inner);
        self.persist(&mut inner).await;
        Ok(())
    }

    /// Record a failed attempt that still has retry budget: back to
    /// `pending` with the computed backoff window.
    pub async fn schedule_retry(
        &self,
        result: ExecutionResult,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let id = result.operation_id;
        let op = inner
            .operations
            .get_mut(&id)
            .ok_or(SyncError::OperationNotFound(id))?;
        if op.status != OperationStatus::Executing {
            return Err(SyncError::StateTransition(format!(
                "retry scheduled for operation {id} while {}",
                op.status
            )));
        }

        op.status = OperationStatus::Pending;
        op.retry_count = retry_count;
        op.next_attempt_at = Some(next_attempt_at);
        warn!(
            operation_id = %id,
            retry_count,
            next_attempt_at = %next_attempt_at,
            error = result.error.as_deref().unwrap_or("unknown"),
            "Operation failed, retry scheduled"
        );
        inner.results.insert(id, result);
        self.publisher.publish(SyncEvent::OperationRetryScheduled {
            operation_id: id,
            retry_count,
            next_attempt_at,
        });

        self.persist(&mut inner).await;
        Ok(())
    }

    /// Move an operation to `failed_permanent` and cascade to dependents.
    ///
    /// Dependents of a permanently failed operation can never become
    /// eligible, so they are failed as well with a distinct
    /// `blocked_by_dependency` reason, recursively.
    pub async fn fail_permanent(
        &self,
        id: Uuid,
        reason: FailureReason,
        result: Option<ExecutionResult>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let error = result.as_ref().and_then(|r| r.error.clone());
        {
            let op = inner
                .operations
                .get_mut(&id)
                .ok_or(SyncError::OperationNotFound(id))?;
            if op.status != OperationStatus::Executing {
                return Err(SyncError::StateTransition(format!(
                    "operation {id} failed permanently while {}",
                    op.status
                )));
            }
            op.status = OperationStatus::FailedPermanent;
            op.failure_reason = Some(reason);
        }
        if let Some(result) = result {
            inner.results.insert(id, result);
        }
        warn!(operation_id = %id, reason = ?reason, "Operation failed permanently");
        self.publisher.publish(SyncEvent::OperationFailed {
            operation_id: id,
            reason,
            error,
        });

        self.cascade_block(&mut inner, id);
        self.prune(&mut inner);
        self.persist(&mut inner).await;
        Ok(())
    }

    /// Fail every pending operation that transitively depends on `root`,
    /// breadth-first over the reverse dependency edges. `root` itself is
    /// already terminal (failed or cancelled) when this runs.
    fn cascade_block(&self, inner: &mut QueueInner, root: Uuid) {
        let mut frontier = vec![root];
        while let Some(unsatisfiable) = frontier.pop() {
            let blocked: Vec<Uuid> = inner
                .operations
                .values()
                .filter(|op| {
                    op.status == OperationStatus::Pending
                        && op.dependencies.contains(&unsatisfiable)
                })
                .map(|op| op.id)
                .collect();
            for blocked_id in blocked {
                if let Some(op) = inner.operations.get_mut(&blocked_id) {
                    op.status = OperationStatus::FailedPermanent;
                    op.failure_reason = Some(FailureReason::BlockedByDependency);
                }
                warn!(
                    operation_id = %blocked_id,
                    dependency = %unsatisfiable,
                    "Operation blocked by unsatisfiable dependency"
                );
                self.publisher.publish(SyncEvent::OperationFailed {
                    operation_id: blocked_id,
                    reason: FailureReason::BlockedByDependency,
                    error: None,
                });
                frontier.push(blocked_id);
            }
        }
    }

    /// Whether the last save succeeded.
    pub async fn is_durable(&self) -> bool {
        self.inner.lock().await.durable
    }

    /// Clones of all operations and results, for statistics and snapshots.
    pub async fn state(&self) -> (Vec<Operation>, Vec<ExecutionResult>) {
        let inner = self.inner.lock().await;
        (
            inner.operations.values().cloned().collect(),
            inner.results.values().cloned().collect(),
        )
    }

    /// Drop the oldest terminal operations (and their results) beyond the
    /// retention window. Non-terminal operations are never pruned, and
    /// neither is a terminal operation some non-terminal operation still
    /// depends on: its recorded result is what makes the dependent eligible.
    fn prune(&self, inner: &mut QueueInner) {
        let referenced: HashSet<Uuid> = inner
            .operations
            .values()
            .filter(|op| !op.status.is_terminal())
            .flat_map(|op| op.dependencies.iter().copied())
            .collect();
        let mut terminal: Vec<(Uuid, DateTime<Utc>)> = inner
            .operations
            .values()
            .filter(|op| op.status.is_terminal() && !referenced.contains(&op.id))
            .map(|op| (op.id, op.created_at))
            .collect();
        if terminal.len() <= self.result_retention {
            return;
        }
        terminal.sort_by_key(|(_, created_at)| *created_at);
        let excess = terminal.len() - self.result_retention;
        for (id, _) in terminal.into_iter().take(excess) {
            inner.operations.remove(&id);
            inner.results.remove(&id);
        }
    }

    /// Save a snapshot while still holding the queue lock, flagging
    /// durability changes through events.
    async fn persist(&self, inner: &mut QueueInner) {
        let snapshot = QueueSnapshot::new(
            inner.operations.values().cloned().collect(),
            inner.results.values().cloned().collect(),
        );
        match self.store.save_queue_state(&snapshot).await {
            Ok(()) => {
                if !inner.durable {
                    inner.durable = true;
                    info!("Persistence recovered, queue durable again");
                    self.publisher.publish(SyncEvent::PersistenceRecovered);
                }
            }
            Err(error) => {
                if inner.durable {
                    inner.durable = false;
                    warn!(%error, "Queue snapshot save failed, continuing non-durably");
                }
                self.publisher.publish(SyncEvent::OperationsPersistFailed {
                    error: error.to_string(),
                });
            }
        }
    }
}
