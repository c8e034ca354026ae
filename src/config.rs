use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for one sync engine instance. Intervals are stored as millis so
/// the struct round-trips through `sync.json` without custom serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Name of the fleet-wide leader lock row.
    pub lock_name: String,
    /// Stable identifier of this instance, used as the lock holder id.
    pub instance_id: String,
    /// How often the leader renews the lock row.
    pub heartbeat_interval_ms: u64,
    /// Age past which a lock row is considered abandoned and reclaimable.
    /// Must be well above the heartbeat interval to ride out network blips.
    pub lock_expiry_ms: u64,
    /// Poll interval while waiting for the lock to become free.
    pub acquire_retry_interval_ms: u64,
    /// Capacity of the bounded change-event queue per sync session.
    pub queue_capacity: usize,
    /// Max concurrently running handler invocations for a single event.
    pub handler_parallelism: usize,
    /// Attempts per change event before it is declared poison.
    pub max_apply_attempts: u32,
    /// Base backoff between apply attempts (grows linearly, jittered).
    pub retry_backoff_ms: u64,
    /// Emit latency/queue-depth metrics every N processed events.
    pub metrics_every: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let instance_id = std::env::var("SEARCHSYNC_INSTANCE_ID")
            .unwrap_or_else(|_| format!("sync-{}", uuid::Uuid::new_v4().simple()));

        SyncConfig {
            lock_name: "search-sync".to_string(),
            instance_id,
            heartbeat_interval_ms: 10_000,
            lock_expiry_ms: 70_000,
            acquire_retry_interval_ms: 1_000,
            queue_capacity: 1_000,
            handler_parallelism: 4,
            max_apply_attempts: 3,
            retry_backoff_ms: 100,
            metrics_every: 5_000,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `{data_dir}/sync.json` or return defaults.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let sync_json = data_dir.join("sync.json");

        if sync_json.exists() {
            match std::fs::read_to_string(&sync_json) {
                Ok(content) => match serde_json::from_str::<SyncConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded sync config: instance_id={}, lock={}",
                            config.instance_id,
                            config.lock_name
                        );
                        return config;
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse sync.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read sync.json: {}, using defaults", e);
                }
            }
        }

        SyncConfig::default()
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.queue_capacity == 0 {
            return Err(crate::SyncError::Config(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if self.handler_parallelism == 0 {
            return Err(crate::SyncError::Config(
                "handler_parallelism must be > 0".to_string(),
            ));
        }
        if self.max_apply_attempts == 0 {
            return Err(crate::SyncError::Config(
                "max_apply_attempts must be > 0".to_string(),
            ));
        }
        if self.lock_expiry_ms <= self.heartbeat_interval_ms {
            return Err(crate::SyncError::Config(format!(
                "lock_expiry_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.lock_expiry_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    pub fn acquire_retry_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_retry_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
