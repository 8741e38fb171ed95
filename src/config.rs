//! Engine configuration with environment-variable overrides.

use crate::error::{Result, SyncError};

/// Tunables for the synchronization engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Pending-operation ceiling; `enqueue` rejects beyond this.
    pub max_queue_size: usize,
    /// Maximum operations selected into one batch.
    pub batch_size: usize,
    /// Maximum batches simultaneously in flight.
    pub max_concurrent_batches: usize,
    /// Periodic scheduler tick interval.
    pub tick_interval_ms: u64,
    /// Retry budget applied when a spec does not override it.
    pub default_max_retries: u32,
    /// Ascending backoff table; the last entry is the ceiling.
    pub retry_intervals_ms: Vec<u64>,
    /// Deadline for a single executor invocation.
    pub executor_timeout_ms: u64,
    /// How often the network monitor probes.
    pub network_probe_interval_ms: u64,
    /// Deadline for one probe; a hung probe degrades quality to poor.
    pub network_probe_timeout_ms: u64,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_channel_capacity: usize,
    /// Terminal results retained in the snapshot for dependency lookups.
    pub result_retention: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            batch_size: 10,
            max_concurrent_batches: 3,
            tick_interval_ms: 5000,
            default_max_retries: 3,
            retry_intervals_ms: vec![1000, 2000, 5000, 10_000, 30_000],
            executor_timeout_ms: 30_000,
            network_probe_interval_ms: 10_000,
            network_probe_timeout_ms: 3000,
            event_channel_capacity: 1000,
            result_retention: 500,
        }
    }
}

impl SyncConfig {
    /// Build a config from defaults plus `OPSYNC_*` environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("OPSYNC_MAX_QUEUE_SIZE") {
            config.max_queue_size = value.parse().map_err(|e| {
                SyncError::Configuration(format!("Invalid max_queue_size: {e}"))
            })?;
        }
        if let Ok(value) = std::env::var("OPSYNC_BATCH_SIZE") {
            config.batch_size = value
                .parse()
                .map_err(|e| SyncError::Configuration(format!("Invalid batch_size: {e}")))?;
        }
        if let Ok(value) = std::env::var("OPSYNC_MAX_CONCURRENT_BATCHES") {
            config.max_concurrent_batches = value.parse().map_err(|e| {
                SyncError::Configuration(format!("Invalid max_concurrent_batches: {e}"))
            })?;
        }
        if let Ok(value) = std::env::var("OPSYNC_TICK_INTERVAL_MS") {
            config.tick_interval_ms = value.parse().map_err(|e| {
                SyncError::Configuration(format!("Invalid tick_interval_ms: {e}"))
            })?;
        }
        if let Ok(value) = std::env::var("OPSYNC_DEFAULT_MAX_RETRIES") {
            config.default_max_retries = value.parse().map_err(|e| {
                SyncError::Configuration(format!("Invalid default_max_retries: {e}"))
            })?;
        }
        if let Ok(value) = std::env::var("OPSYNC_EXECUTOR_TIMEOUT_MS") {
            config.executor_timeout_ms = value.parse().map_err(|e| {
                SyncError::Configuration(format!("Invalid executor_timeout_ms: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(SyncError::Configuration(
                "max_queue_size must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Configuration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_batches == 0 {
            return Err(SyncError::Configuration(
                "max_concurrent_batches must be greater than zero".to_string(),
            ));
        }
        if self.retry_intervals_ms.is_empty() {
            return Err(SyncError::Configuration(
                "retry_intervals_ms must not be empty".to_string(),
            ));
        }
        if self.retry_intervals_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(SyncError::Configuration(
                "retry_intervals_ms must be ascending".to_string(),
            ));
        }
        Ok(())
    }
}
