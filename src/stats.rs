//! On-demand statistics over operation and result history.
//!
//! Snapshots are recomputed from the queue's current state on every query
//! rather than maintained incrementally, so they cannot drift.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::network::{NetworkMonitor, NetworkQuality};
use crate::queue::OperationQueue;

/// Per-operation-type counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeStatistics {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
    pub total_operations: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub executing: usize,
    pub cancelled: usize,
    /// Mean executor duration over retained results, in milliseconds.
    pub average_latency_ms: f64,
    /// Successful attempts over all retained attempts, 0.0 when idle.
    pub success_rate: f64,
    pub by_type: HashMap<String, TypeStatistics>,
    pub network_status: NetworkQuality,
}

/// Computes statistics snapshots from the queue and network monitor.
pub struct StatisticsAggregator {
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
}

impl StatisticsAggregator {
    pub fn new(queue: Arc<OperationQueue>, network: Arc<NetworkMonitor>) -> Self {
        Self { queue, network }
    }

    pub async fn snapshot(&self) -> SyncStatistics {
        use crate::operation::OperationStatus::*;

        let (operations, results) = self.queue.state().await;

        let mut stats = SyncStatistics {
            total_operations: operations.len(),
            completed: 0,
            failed: 0,
            pending: 0,
            executing: 0,
            cancelled: 0,
            average_latency_ms: 0.0,
            success_rate: 0.0,
            by_type: HashMap::new(),
            network_status: self.network.quality(),
        };

        for op in &operations {
            let entry = stats.by_type.entry(op.op_type.clone()).or_default();
            entry.total += 1;
            match op.status {
                Completed => {
                    stats.completed += 1;
                    entry.completed += 1;
                }
                FailedPermanent => {
                    stats.failed += 1;
                    entry.failed += 1;
                }
                Pending => stats.pending += 1,
                Executing => stats.executing += 1,
                Cancelled => stats.cancelled += 1,
            }
        }

        if !results.is_empty() {
            let total_ms: u64 = results.iter().map(|r| r.duration_ms).sum();
            let successes = results.iter().filter(|r| r.success).count();
            stats.average_latency_ms = total_ms as f64 / results.len() as f64;
            stats.success_rate = successes as f64 / results.len() as f64;
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPublisher;
    use crate::network::StaticProbe;
    use crate::operation::{ExecutionResult, FailureReason, OperationSpec};
    use crate::persistence::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn aggregator() -> (StatisticsAggregator, Arc<OperationQueue>) {
        let publisher = EventPublisher::new(64);
        let queue = Arc::new(OperationQueue::new(
            Arc::new(MemoryStore::new()),
            publisher.clone(),
            100,
            50,
            3,
        ));
        let network = Arc::new(NetworkMonitor::new(
            Arc::new(StaticProbe::new(Some(Duration::from_millis(10)))),
            publisher,
            Duration::from_secs(60),
            Duration::from_millis(100),
        ));
        (StatisticsAggregator::new(queue.clone(), network), queue)
    }

    #[tokio::test]
    async fn test_idle_snapshot() {
        let (aggregator, _queue) = aggregator();
        let stats = aggregator.snapshot().await;
        assert_eq!(stats.total_operations, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn test_counts_and_latency() {
        let (aggregator, queue) = aggregator();

        let ok = queue.enqueue(OperationSpec::new("payment", "card")).await.unwrap();
        let bad = queue.enqueue(OperationSpec::new("inventory", "adjust")).await.unwrap();
        let idle = queue.enqueue(OperationSpec::new("payment", "refund")).await.unwrap();

        queue.claim_batch(2, Utc::now()).await;
        queue.complete(ExecutionResult::success(ok, 30)).await.unwrap();
        queue
            .fail_permanent(
                bad,
                FailureReason::RetriesExhausted,
                Some(ExecutionResult::failure(bad, 10, "remote 500")),
            )
            .await
            .unwrap();

        let stats = aggregator.snapshot().await;
        assert_eq!(stats.total_operations, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.average_latency_ms, 20.0);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.by_type["payment"].total, 2);
        assert_eq!(stats.by_type["payment"].completed, 1);
        assert_eq!(stats.by_type["inventory"].failed, 1);

        // Pending operation still pending.
        assert!(queue.get(idle).await.is_some());
    }
}
