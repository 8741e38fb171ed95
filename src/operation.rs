//! Core data model: operations, their lifecycle states, and execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Scheduling priority for a queued operation.
///
/// `Critical` additionally triggers an immediate scheduling pass instead of
/// waiting for the next periodic tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl OperationPriority {
    /// Numeric weight used by the priority sorter (higher runs first).
    pub fn weight(&self) -> f64 {
        match self {
            Self::Critical => 10.0,
            Self::High => 5.0,
            Self::Normal => 1.0,
            Self::Low => 0.5,
        }
    }
}

impl Default for OperationPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for OperationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for OperationPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid operation priority: {s}")),
        }
    }
}

/// Operation lifecycle states.
///
/// `pending → executing → {completed | failed_permanent}`, with transient
/// failures returning to `pending` under the retry budget. Cancellation is
/// only reachable from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for selection into a batch (initial state, and the state a
    /// transiently failed operation returns to).
    Pending,
    /// Selected into a batch and currently dispatched to its executor.
    Executing,
    /// Executor reported success (terminal).
    Completed,
    /// Retry budget exhausted or blocked by a failed dependency (terminal).
    FailedPermanent,
    /// Removed by the producer before execution (terminal).
    Cancelled,
}

impl OperationStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedPermanent | Self::Cancelled)
    }

    /// Whether an operation in this state satisfies dependents' dependency
    /// checks.
    pub fn satisfies_dependencies(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Executing)
    }
}

impl Default for OperationStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::FailedPermanent => write!(f, "failed_permanent"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed_permanent" => Ok(Self::FailedPermanent),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid operation status: {s}")),
        }
    }
}

/// Why an operation reached `failed_permanent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The operation's own retry budget ran out.
    RetriesExhausted,
    /// A dependency failed permanently; the cascade policy failed this
    /// operation without ever attempting it.
    BlockedByDependency,
}

/// Producer-supplied description of work to enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSpec {
    pub op_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub priority: OperationPriority,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Overrides the configured default when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Optional hint for batch time budgeting, in milliseconds.
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

impl OperationSpec {
    pub fn new(op_type: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            subtype: subtype.into(),
            priority: OperationPriority::Normal,
            payload: Value::Null,
            dependencies: Vec::new(),
            max_retries: None,
            estimated_duration_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: OperationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_estimated_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = Some(ms);
        self
    }

    /// Reject malformed specs before they reach the queue.
    pub fn validate(&self) -> Result<()> {
        if self.op_type.trim().is_empty() {
            return Err(SyncError::Validation(
                "operation type must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(*dep) {
                return Err(SyncError::Validation(format!(
                    "duplicate dependency {dep} in operation spec"
                )));
            }
        }
        Ok(())
    }
}

/// A queued unit of business work awaiting remote execution.
///
/// Owned exclusively by the operation queue; all field mutation happens
/// through its documented transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub op_type: String,
    pub subtype: String,
    pub priority: OperationPriority,
    pub payload: Value,
    pub dependencies: Vec<Uuid>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
}

impl Operation {
    /// Materialize a spec into a pending operation at enqueue time.
    pub fn from_spec(spec: OperationSpec, default_max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: spec.op_type,
            subtype: spec.subtype,
            priority: spec.priority,
            payload: spec.payload,
            dependencies: spec.dependencies,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            status: OperationStatus::Pending,
            failure_reason: None,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            estimated_duration_ms: spec.estimated_duration_ms,
        }
    }
}

/// Immutable record of a single execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub operation_id: Uuid,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    /// Remote-side conflict count reported by the executor, when applicable.
    #[serde(default)]
    pub conflicts: u32,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(operation_id: Uuid, duration_ms: u64) -> Self {
        Self {
            operation_id,
            success: true,
            duration_ms,
            error: None,
            conflicts: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(operation_id: Uuid, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            operation_id,
            success: false,
            duration_ms,
            error: Some(error.into()),
            conflicts: 0,
            completed_at: Utc::now(),
        }
    }
}
