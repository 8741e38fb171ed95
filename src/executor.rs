//! Pluggable executor registry.
//!
//! The domain layer registers one handler per `(type, subtype)` pair; the
//! scheduler dispatches operations through the registry, which wraps every
//! invocation in a deadline so a hung handler cannot starve the concurrency
//! budget. Handlers report expected failures through their outcome value and
//! never mutate queue state directly.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::operation::{ExecutionResult, Operation};

/// What a handler reports back for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Remote-side conflicts resolved during the attempt, when applicable.
    pub conflicts: u32,
}

impl ExecutionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            conflicts: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            conflicts: 0,
        }
    }

    pub fn with_conflicts(mut self, conflicts: u32) -> Self {
        self.conflicts = conflicts;
        self
    }
}

/// Domain-supplied handler performing the actual remote effect for one
/// operation type.
///
/// Handlers must be idempotent or tolerate duplicate effects: execution is
/// at-least-once across process restarts.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &Operation) -> ExecutionOutcome;
}

/// Registry lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutorKey {
    pub op_type: String,
    pub subtype: String,
}

impl ExecutorKey {
    pub fn new(op_type: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            subtype: subtype.into(),
        }
    }

    pub fn from_operation(op: &Operation) -> Self {
        Self {
            op_type: op.op_type.clone(),
            subtype: op.subtype.clone(),
        }
    }
}

impl std::fmt::Display for ExecutorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.op_type, self.subtype)
    }
}

/// Maps operation types to handlers and dispatches with a deadline.
pub struct ExecutorRegistry {
    handlers: DashMap<ExecutorKey, Arc<dyn OperationExecutor>>,
    timeout: Duration,
}

impl ExecutorRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: DashMap::new(),
            timeout,
        }
    }

    /// Register a handler for an exact `(type, subtype)` pair.
    pub fn register(
        &self,
        op_type: impl Into<String>,
        subtype: impl Into<String>,
        handler: Arc<dyn OperationExecutor>,
    ) {
        let key = ExecutorKey::new(op_type, subtype);
        debug!(executor = %key, "Registering operation executor");
        self.handlers.insert(key, handler);
    }

    /// Register a fallback handler for every subtype of a type.
    pub fn register_type(&self, op_type: impl Into<String>, handler: Arc<dyn OperationExecutor>) {
        self.register(op_type, "*", handler);
    }

    /// Resolve the handler for an operation, trying the exact pair first and
    /// falling back to the type-level wildcard.
    pub fn resolve(&self, op: &Operation) -> Result<Arc<dyn OperationExecutor>> {
        let exact = ExecutorKey::from_operation(op);
        if let Some(handler) = self.handlers.get(&exact) {
            return Ok(handler.clone());
        }
        let wildcard = ExecutorKey::new(op.op_type.clone(), "*");
        if let Some(handler) = self.handlers.get(&wildcard) {
            return Ok(handler.clone());
        }
        Err(SyncError::ExecutorNotFound {
            op_type: op.op_type.clone(),
            subtype: op.subtype.clone(),
        })
    }

    /// Dispatch one operation to its handler under the configured deadline.
    ///
    /// The handler runs on its own task so a panicking handler cannot take
    /// the calling batch down with it; both a panic and an exceeded deadline
    /// are recorded as failed attempts and take the normal retry path.
    pub async fn execute(&self, op: &Operation) -> Result<ExecutionResult> {
        let handler = self.resolve(op)?;
        let start = Instant::now();

        let mut invocation = {
            let operation = op.clone();
            tokio::spawn(async move { handler.execute(&operation).await })
        };
        let outcome = match tokio::time::timeout(self.timeout, &mut invocation).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                warn!(
                    operation_id = %op.id,
                    op_type = %op.op_type,
                    panicked = join_error.is_panic(),
                    "Executor task aborted"
                );
                if join_error.is_panic() {
                    ExecutionOutcome::failed("executor panicked during execution")
                } else {
                    ExecutionOutcome::failed("executor task cancelled")
                }
            }
            Err(_) => {
                invocation.abort();
                warn!(
                    operation_id = %op.id,
                    op_type = %op.op_type,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Executor deadline exceeded"
                );
                ExecutionOutcome::failed(format!(
                    "execution deadline exceeded after {}ms",
                    self.timeout.as_millis()
                ))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = if outcome.success {
            let mut result = ExecutionResult::success(op.id, duration_ms);
            result.conflicts = outcome.conflicts;
            result
        } else {
            let mut result = ExecutionResult::failure(
                op.id,
                duration_ms,
                outcome.error.unwrap_or_else(|| "unknown executor failure".to_string()),
            );
            result.conflicts = outcome.conflicts;
            result
        };
        Ok(result)
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registered keys, for diagnostics.
    pub fn registered_keys(&self) -> Vec<ExecutorKey> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationSpec;

    struct AlwaysOk;

    #[async_trait]
    impl OperationExecutor for AlwaysOk {
        async fn execute(&self, _operation: &Operation) -> ExecutionOutcome {
            ExecutionOutcome::ok()
        }
    }

    struct AlwaysPanics;

    #[async_trait]
    impl OperationExecutor for AlwaysPanics {
        async fn execute(&self, _operation: &Operation) -> ExecutionOutcome {
            panic!("handler bug")
        }
    }

    struct NeverFinishes;

    #[async_trait]
    impl OperationExecutor for NeverFinishes {
        async fn execute(&self, _operation: &Operation) -> ExecutionOutcome {
            std::future::pending().await
        }
    }

    fn op(op_type: &str, subtype: &str) -> Operation {
        Operation::from_spec(OperationSpec::new(op_type, subtype), 3)
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_resolution() {
        let registry = ExecutorRegistry::new(Duration::from_secs(1));
        registry.register("payment", "card", Arc::new(AlwaysOk));
        registry.register_type("analytics", Arc::new(AlwaysOk));

        assert!(registry.resolve(&op("payment", "card")).is_ok());
        assert!(registry.resolve(&op("analytics", "page_view")).is_ok());
        assert!(matches!(
            registry.resolve(&op("payment", "ach")),
            Err(SyncError::ExecutorNotFound { .. })
        ));
        assert_eq!(registry.handler_count(), 2);
    }

    #[tokio::test]
    async fn test_successful_dispatch_records_result() {
        let registry = ExecutorRegistry::new(Duration::from_secs(1));
        registry.register("payment", "card", Arc::new(AlwaysOk));

        let operation = op("payment", "card");
        let result = registry.execute(&operation).await.unwrap();
        assert!(result.success);
        assert_eq!(result.operation_id, operation.id);
    }

    #[tokio::test]
    async fn test_hung_handler_times_out_as_failure() {
        let registry = ExecutorRegistry::new(Duration::from_millis(50));
        registry.register("document", "upload", Arc::new(NeverFinishes));

        let result = registry.execute(&op("document", "upload")).await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_panicking_handler_records_failed_attempt() {
        let registry = ExecutorRegistry::new(Duration::from_secs(1));
        registry.register("inventory", "adjust", Arc::new(AlwaysPanics));

        let result = registry.execute(&op("inventory", "adjust")).await.unwrap();
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("panicked"));
    }

    #[test]
    fn test_unregistered_type_is_an_error() {
        let registry = ExecutorRegistry::new(Duration::from_secs(1));
        let err = tokio_test::block_on(registry.execute(&op("inventory", "adjust"))).unwrap_err();
        assert!(matches!(err, SyncError::ExecutorNotFound { .. }));
    }
}
