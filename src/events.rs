//! Typed lifecycle event bus.
//!
//! Observers subscribe through a tokio broadcast channel; publishing never
//! fails when no one is listening. Payloads are typed per event category so
//! subscribers get compile-time checking instead of string event names.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::network::NetworkQuality;
use crate::operation::{ExecutionResult, FailureReason, Operation};

/// Lifecycle notification published by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    OperationQueued {
        operation: Operation,
    },
    OperationStarted {
        operation_id: Uuid,
        batch_id: Uuid,
    },
    OperationCompleted {
        operation_id: Uuid,
        result: ExecutionResult,
    },
    OperationFailed {
        operation_id: Uuid,
        reason: FailureReason,
        error: Option<String>,
    },
    OperationRetryScheduled {
        operation_id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    OperationCancelled {
        operation_id: Uuid,
    },
    BatchStarted {
        batch_id: Uuid,
        operation_ids: Vec<Uuid>,
    },
    BatchCompleted {
        batch_id: Uuid,
        succeeded: usize,
        failed: usize,
    },
    NetworkStatusChanged {
        previous: NetworkQuality,
        current: NetworkQuality,
    },
    /// A `save_queue_state` call failed; the queue is running non-durably.
    OperationsPersistFailed {
        error: String,
    },
    /// Durability recovered after one or more failed saves.
    PersistenceRecovered,
    /// The startup snapshot was unreadable; the engine started empty.
    SnapshotLoadFailed {
        error: String,
    },
}

impl SyncEvent {
    /// Stable name for logging and filtering.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OperationQueued { .. } => "operation_queued",
            Self::OperationStarted { .. } => "operation_started",
            Self::OperationCompleted { .. } => "operation_completed",
            Self::OperationFailed { .. } => "operation_failed",
            Self::OperationRetryScheduled { .. } => "operation_retry_scheduled",
            Self::OperationCancelled { .. } => "operation_cancelled",
            Self::BatchStarted { .. } => "batch_started",
            Self::BatchCompleted { .. } => "batch_completed",
            Self::NetworkStatusChanged { .. } => "network_status_changed",
            Self::OperationsPersistFailed { .. } => "operations_persist_failed",
            Self::PersistenceRecovered => "persistence_recovered",
            Self::SnapshotLoadFailed { .. } => "snapshot_load_failed",
        }
    }
}

/// Fan-out publisher for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventPublisher {
    /// Create a publisher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// A broadcast send errors only when there are no subscribers, which is
    /// an acceptable outcome for lifecycle notifications.
    pub fn publish(&self, event: SyncEvent) {
        tracing::debug!(event = event.name(), "Publishing lifecycle event");
        let _ = self.sender.send(event);
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(16);
        publisher.publish(SyncEvent::PersistenceRecovered);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_typed_event() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();

        let id = Uuid::new_v4();
        publisher.publish(SyncEvent::OperationCancelled { operation_id: id });

        match rx.recv().await.unwrap() {
            SyncEvent::OperationCancelled { operation_id } => assert_eq!(operation_id, id),
            other => panic!("unexpected event: {}", other.name()),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            SyncEvent::OperationsPersistFailed {
                error: "disk".to_string()
            }
            .name(),
            "operations_persist_failed"
        );
        assert_eq!(
            SyncEvent::NetworkStatusChanged {
                previous: NetworkQuality::Good,
                current: NetworkQuality::Offline,
            }
            .name(),
            "network_status_changed"
        );
    }
}
