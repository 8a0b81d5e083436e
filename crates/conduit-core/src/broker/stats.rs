use crate::clock::NANOS_PER_SEC;
use crate::queue::{QueueConfig, QueueCounters};

/// Snapshot of one queue's counters with the derived rates computed on read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMetrics {
    pub queue: String,
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    pub retried: u64,
    /// `failed / max(total, 1) * 100`.
    pub error_rate: f64,
    /// Completed messages per second since the queue was created.
    pub throughput_per_sec: f64,
    pub created_at: u64,
    pub last_activity_at: Option<u64>,
}

impl QueueMetrics {
    pub fn from_counters(queue: &str, counters: &QueueCounters, now_ns: u64) -> Self {
        let error_rate = counters.failed as f64 / counters.total.max(1) as f64 * 100.0;
        let elapsed_secs = now_ns.saturating_sub(counters.created_at) as f64 / NANOS_PER_SEC as f64;
        let throughput_per_sec = if elapsed_secs > 0.0 {
            counters.completed as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            queue: queue.to_string(),
            total: counters.total,
            pending: counters.pending,
            processing: counters.processing,
            completed: counters.completed,
            failed: counters.failed,
            dead_letter: counters.dead_letter,
            retried: counters.retried,
            error_rate,
            throughput_per_sec,
            created_at: counters.created_at,
            last_activity_at: counters.last_activity_at,
        }
    }
}

/// One entry of `ListQueues`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSummary {
    pub config: QueueConfig,
    pub metrics: QueueMetrics,
}
