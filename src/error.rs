//! Structured error types for the synchronization engine.
//!
//! Validation problems (malformed specs, cycles, queue capacity) surface
//! synchronously to producers; execution failures flow through the retry
//! path and never raise out of the scheduling loop.

use uuid::Uuid;

/// Crate-wide error taxonomy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Pending-operation ceiling reached; the producer must back off.
    #[error("Queue is full: {pending} pending operations (limit {limit})")]
    QueueFull { pending: usize, limit: usize },

    /// The operation's dependency set would introduce a cycle.
    #[error("Dependency cycle detected involving operation {0}")]
    DependencyCycle(Uuid),

    /// Malformed operation spec rejected at enqueue time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No operation with the given id exists in the queue.
    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),

    /// No executor registered for an operation's type/subtype.
    #[error("No executor registered for {op_type}/{subtype}")]
    ExecutorNotFound { op_type: String, subtype: String },

    /// Persistence layer failure; the queue continues in degraded mode.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An attempted state transition violates the operation state machine.
    #[error("State transition error: {0}")]
    StateTransition(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
