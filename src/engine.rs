//! Engine composition root.
//!
//! `SyncEngine` wires the queue, scheduler, network monitor, executor
//! registry, and statistics together from injected collaborators. There is
//! no global instance: the owning application constructs one (or several,
//! in tests) and passes it by reference to producers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{EventPublisher, SyncEvent};
use crate::executor::{ExecutorRegistry, OperationExecutor};
use crate::network::{NetworkMonitor, NetworkProbe, NetworkQuality};
use crate::operation::{Operation, OperationPriority, OperationSpec};
use crate::persistence::PersistenceStore;
use crate::queue::OperationQueue;
use crate::retry::RetryManager;
use crate::scheduler::BatchScheduler;
use crate::stats::{StatisticsAggregator, SyncStatistics};

/// Offline-first synchronization engine.
pub struct SyncEngine {
    queue: Arc<OperationQueue>,
    registry: Arc<ExecutorRegistry>,
    network: Arc<NetworkMonitor>,
    scheduler: Arc<BatchScheduler>,
    stats: StatisticsAggregator,
    publisher: EventPublisher,
    store: Arc<dyn PersistenceStore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build an engine from a validated configuration and injected
    /// collaborators. Executors are registered afterwards through
    /// [`SyncEngine::register_executor`] before calling [`SyncEngine::start`].
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn PersistenceStore>,
        probe: Arc<dyn NetworkProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let publisher = EventPublisher::new(config.event_channel_capacity);
        let queue = Arc::new(OperationQueue::new(
            store.clone(),
            publisher.clone(),
            config.max_queue_size,
            config.result_retention,
            config.default_max_retries,
        ));
        let registry = Arc::new(ExecutorRegistry::new(Duration::from_millis(
            config.executor_timeout_ms,
        )));
        let network = Arc::new(NetworkMonitor::new(
            probe,
            publisher.clone(),
            Duration::from_millis(config.network_probe_interval_ms),
            Duration::from_millis(config.network_probe_timeout_ms),
        ));
        let scheduler = Arc::new(BatchScheduler::new(
            queue.clone(),
            registry.clone(),
            RetryManager::new(&config.retry_intervals_ms),
            network.clone(),
            publisher.clone(),
            config.batch_size,
            Duration::from_millis(config.tick_interval_ms),
            config.max_concurrent_batches,
        ));
        let stats = StatisticsAggregator::new(queue.clone(), network.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            queue,
            registry,
            network,
            scheduler,
            stats,
            publisher,
            store,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the domain handler for a `(type, subtype)` pair.
    pub fn register_executor(
        &self,
        op_type: impl Into<String>,
        subtype: impl Into<String>,
        handler: Arc<dyn OperationExecutor>,
    ) {
        self.registry.register(op_type, subtype, handler);
    }

    /// Register a fallback handler for all subtypes of a type.
    pub fn register_executor_type(
        &self,
        op_type: impl Into<String>,
        handler: Arc<dyn OperationExecutor>,
    ) {
        self.registry.register_type(op_type, handler);
    }

    /// Recover persisted state and spawn the background loops.
    ///
    /// A missing snapshot starts empty; an unreadable one also starts empty
    /// but emits `snapshot_load_failed` so operators can react.
    pub async fn start(&self) -> Result<()> {
        match self.store.load_queue_state().await {
            Ok(Some(snapshot)) => self.queue.restore(snapshot).await,
            Ok(None) => info!("No persisted queue state, starting empty"),
            Err(error) => {
                warn!(%error, "Failed to load queue snapshot, starting empty");
                self.publisher.publish(SyncEvent::SnapshotLoadFailed {
                    error: error.to_string(),
                });
            }
        }

        self.network.check_now().await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            Arc::clone(&self.network).run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.scheduler).run(self.shutdown.subscribe()),
        ));
        info!(
            executors = self.registry.handler_count(),
            "Sync engine started"
        );
        Ok(())
    }

    /// Enqueue one operation. Critical priority triggers an immediate
    /// scheduling pass instead of waiting for the next tick.
    pub async fn enqueue(&self, spec: OperationSpec) -> Result<Uuid> {
        let critical = spec.priority == OperationPriority::Critical;
        let id = self.queue.enqueue(spec).await?;
        if critical {
            self.scheduler.trigger_now();
        }
        Ok(id)
    }

    /// Enqueue several operations atomically (all-or-nothing validation).
    pub async fn enqueue_batch(&self, specs: Vec<OperationSpec>) -> Result<Vec<Uuid>> {
        let critical = specs
            .iter()
            .any(|spec| spec.priority == OperationPriority::Critical);
        let ids = self.queue.enqueue_all(specs).await?;
        if critical {
            self.scheduler.trigger_now();
        }
        Ok(ids)
    }

    pub async fn get(&self, id: Uuid) -> Option<Operation> {
        self.queue.get(id).await
    }

    /// Cancel a pending operation; returns `false` for anything in flight
    /// or terminal.
    pub async fn cancel(&self, id: Uuid) -> bool {
        self.queue.cancel(id).await
    }

    pub async fn list_pending(&self) -> Vec<Operation> {
        self.queue.list_pending().await
    }

    /// Point-in-time statistics snapshot.
    pub async fn statistics(&self) -> SyncStatistics {
        self.stats.snapshot().await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.publisher.subscribe()
    }

    pub fn network_quality(&self) -> NetworkQuality {
        self.network.quality()
    }

    /// Whether the last snapshot save succeeded.
    pub async fn is_durable(&self) -> bool {
        self.queue.is_durable().await
    }

    /// Force one scheduling pass now.
    pub fn trigger_sync(&self) {
        self.scheduler.trigger_now();
    }

    /// Stop the background loops. In-flight batches run to completion on
    /// their own tasks; queue state is already persisted transition by
    /// transition.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("Sync engine stopped");
    }
}
