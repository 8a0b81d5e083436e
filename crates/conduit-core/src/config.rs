use serde::Deserialize;

/// Top-level configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub saga: SagaConfig,
}

/// Storage configuration (RocksDB data directory).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

/// Scheduler configuration (channel capacity, idle timeout).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub command_channel_capacity: usize,
    /// Idle wakeup interval; each wakeup promotes due retries and reclaims
    /// in-flight messages past their visibility timeout.
    pub idle_timeout_ms: u64,
}

/// Backoff applied by `FailMessage`: `min(base * 2^retry_count, max)`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Retry limit given to queues created without an explicit one.
    pub default_retry_limit: u32,
}

/// Saga engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Used when a definition carries no timeout of its own.
    pub default_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    pub remote_call_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 10_000,
            idle_timeout_ms: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            default_retry_limit: 3,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_count` (1-based).
    pub fn backoff_secs(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            watchdog_interval_ms: 1_000,
            remote_call_timeout_ms: 30_000,
        }
    }
}
