#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Opsync Core
//!
//! Offline-first synchronization engine for intermittently connected
//! clients: a durable operation queue, a priority-aware batch scheduler,
//! and retry orchestration against one remote endpoint.
//!
//! ## Overview
//!
//! Producers enqueue business mutations (payments, inventory changes,
//! customer edits, documents, analytics events) while the device may be
//! offline. The engine delivers them once connectivity permits, without
//! losing operations, duplicating effects beyond idempotent retry, or
//! violating dependency ordering between related mutations.
//!
//! ## Architecture
//!
//! A single scheduling loop decides *what* runs; batch members execute
//! concurrently under a bounded in-flight ceiling. The operation queue is
//! the sole owner of operation state, every transition is persisted before
//! the mutating call returns, and any operation found `executing` after a
//! crash is re-queued (at-least-once execution, handlers are expected to be
//! idempotent).
//!
//! ## Module Organization
//!
//! - [`operation`] - Operation data model and lifecycle states
//! - [`queue`] - Single-writer operation queue with write-through persistence
//! - [`scheduler`] - Batch formation and concurrent dispatch
//! - [`dependency`] - Eligibility gating and cycle validation
//! - [`priority`] - Deterministic candidate ordering
//! - [`retry`] - Exponential-backoff retry policy
//! - [`network`] - Connectivity probing and quality classification
//! - [`executor`] - Pluggable per-type operation executors
//! - [`persistence`] - Snapshot store interface and implementations
//! - [`stats`] - On-demand statistics snapshots
//! - [`events`] - Typed lifecycle event bus
//! - [`engine`] - Composition root
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opsync_core::{SyncConfig, SyncEngine, OperationSpec, OperationPriority};
//! use opsync_core::persistence::FileStore;
//! use opsync_core::network::TcpProbe;
//!
//! # async fn example(executor: Arc<dyn opsync_core::OperationExecutor>) -> opsync_core::Result<()> {
//! let engine = SyncEngine::new(
//!     SyncConfig::default(),
//!     Arc::new(FileStore::new("queue.json")),
//!     Arc::new(TcpProbe::new("198.51.100.7:443".parse().unwrap())),
//! )?;
//! engine.register_executor("payment", "card", executor);
//! engine.start().await?;
//!
//! let id = engine
//!     .enqueue(OperationSpec::new("payment", "card").with_priority(OperationPriority::Critical))
//!     .await?;
//! println!("queued {id}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod logging;
pub mod network;
pub mod operation;
pub mod persistence;
pub mod priority;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod stats;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use events::{EventPublisher, SyncEvent};
pub use executor::{ExecutionOutcome, ExecutorRegistry, OperationExecutor};
pub use network::{NetworkMonitor, NetworkProbe, NetworkQuality};
pub use operation::{
    ExecutionResult, FailureReason, Operation, OperationPriority, OperationSpec, OperationStatus,
};
pub use persistence::{PersistenceStore, QueueSnapshot};
pub use queue::OperationQueue;
pub use scheduler::{Batch, BatchScheduler};
pub use stats::SyncStatistics;
