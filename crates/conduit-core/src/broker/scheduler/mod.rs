use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::broker::command::SchedulerCommand;
use crate::broker::metrics::Metrics;
use crate::clock;
use crate::config::{RetryConfig, SchedulerConfig};
use crate::error::{QueueError, StorageError};
use crate::message::Message;
use crate::queue::{QueueConfig, QueueCounters};
use crate::storage::{keys, Storage, WriteBatchOp};

mod admin_handlers;
mod handlers;
mod recovery;

/// Single-threaded scheduler core. Owns all queue mutations and processes
/// commands from callers via a crossbeam channel.
///
/// Each ownership transition of a message is handled to completion by one
/// command and persisted with a single `write_batch`, so concurrent
/// consumers never observe a half-moved message.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    inbound: Receiver<SchedulerCommand>,
    idle_timeout: Duration,
    retry: RetryConfig,
    running: bool,
    /// Write-through cache of queue configurations. Storage stays the source
    /// of truth; misses fall back to it.
    queues: HashMap<String, QueueConfig>,
    /// OTel metrics for recording counters and gauges.
    metrics: Metrics,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        inbound: Receiver<SchedulerCommand>,
        config: &SchedulerConfig,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            storage,
            inbound,
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            retry: retry.clone(),
            running: true,
            queues: HashMap::new(),
            metrics: Metrics::new(),
        }
    }

    /// Run the scheduler event loop. This blocks the current thread until
    /// a `Shutdown` command is received or the inbound channel is disconnected.
    pub fn run(&mut self) {
        info!("scheduler started");
        self.recover();

        while self.running {
            // Phase 1: Drain all buffered commands (non-blocking)
            let mut drained = 0;
            while let Ok(cmd) = self.inbound.try_recv() {
                self.handle_command(cmd);
                drained += 1;
                if !self.running {
                    break;
                }
            }

            if !self.running {
                break;
            }

            // Phase 2: Park until next command or timeout
            if drained == 0 {
                match self.inbound.recv_timeout(self.idle_timeout) {
                    Ok(cmd) => self.handle_command(cmd),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        // Periodic work: due retries back to pending, stale in-flight reclaimed
                        let now = clock::now_ns();
                        self.promote_due_retries(now);
                        self.reclaim_visibility_timeouts(now);
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        info!("inbound channel disconnected, shutting down");
                        self.running = false;
                    }
                }
            }
        }

        // Flush the WAL to ensure all writes are durable before exit
        if let Err(e) = self.storage.flush() {
            warn!(error = %e, "failed to flush WAL during shutdown");
        }

        info!("scheduler stopped");
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::CreateQueue { config, reply } => {
                info!(queue = %config.name, "create queue command received");
                let result = self.handle_create_queue(config);
                let _ = reply.send(result);
            }
            SchedulerCommand::SendMessage { message, reply } => {
                debug!(queue = %message.queue, msg_id = %message.id, "send command received");
                let result = self.handle_send(message);
                let _ = reply.send(result);
            }
            SchedulerCommand::ReceiveMessage {
                queue,
                consumer_id,
                reply,
            } => {
                debug!(%queue, %consumer_id, "receive command received");
                let result = self.handle_receive(&queue, &consumer_id);
                let _ = reply.send(result);
            }
            SchedulerCommand::CompleteMessage {
                queue,
                msg_id,
                reply,
            } => {
                debug!(%queue, %msg_id, "complete command received");
                let result = self.handle_complete(&queue, &msg_id);
                let _ = reply.send(result);
            }
            SchedulerCommand::FailMessage {
                queue,
                msg_id,
                error,
                reply,
            } => {
                debug!(%queue, %msg_id, %error, "fail command received");
                let result = self.handle_fail(&queue, &msg_id, &error);
                let _ = reply.send(result);
            }
            SchedulerCommand::GetMessage { msg_id, reply } => {
                let result = self.handle_get_message(&msg_id);
                let _ = reply.send(result);
            }
            SchedulerCommand::GetQueueMetrics { queue, reply } => {
                let result = self.handle_get_queue_metrics(&queue);
                let _ = reply.send(result);
            }
            SchedulerCommand::ListQueues { reply } => {
                let result = self.handle_list_queues();
                let _ = reply.send(result);
            }
            SchedulerCommand::Redrive { dlq, count, reply } => {
                info!(%dlq, count, "redrive command received");
                let result = self.handle_redrive(&dlq, count);
                let _ = reply.send(result);
            }
            SchedulerCommand::Shutdown => {
                info!("shutdown command received, draining remaining commands");
                self.running = false;
            }
        }
    }

    /// Queue configuration from the cache, falling back to storage on a miss.
    pub(super) fn queue_config(&mut self, name: &str) -> Result<QueueConfig, QueueError> {
        if let Some(config) = self.queues.get(name) {
            return Ok(config.clone());
        }
        let config = self
            .storage
            .get_queue(name)?
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        self.queues.insert(name.to_string(), config.clone());
        Ok(config)
    }

    pub(super) fn load_counters(&self, queue: &str) -> Result<QueueCounters, QueueError> {
        match self.storage.get_counters(queue)? {
            Some(counters) => Ok(counters),
            None => {
                warn!(%queue, "counters record missing, starting from zero");
                Ok(QueueCounters::new(clock::now_ns()))
            }
        }
    }

    /// Apply `ops` plus the updated counters of every touched queue as one
    /// atomic batch, then refresh the depth gauges.
    pub(super) fn commit(
        &self,
        mut ops: Vec<WriteBatchOp>,
        counters: &[(&str, &QueueCounters)],
    ) -> Result<(), QueueError> {
        for (queue, c) in counters {
            ops.push(put_counters_op(queue, c)?);
        }
        self.storage.write_batch(ops)?;
        for (queue, c) in counters {
            self.metrics.set_queue_depth(queue, c.pending);
        }
        Ok(())
    }

    /// Access the storage layer (used by tests).
    #[cfg(test)]
    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Swap in metrics bound to a test meter provider.
    #[cfg(test)]
    pub(crate) fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

pub(super) fn put_message_op(msg: &Message) -> Result<WriteBatchOp, StorageError> {
    Ok(WriteBatchOp::PutMessage {
        key: keys::message_key(&msg.id),
        value: serde_json::to_vec(msg)?,
    })
}

pub(super) fn put_queue_op(config: &QueueConfig) -> Result<WriteBatchOp, StorageError> {
    Ok(WriteBatchOp::PutQueue {
        key: config.name.as_bytes().to_vec(),
        value: serde_json::to_vec(config)?,
    })
}

fn put_counters_op(queue: &str, counters: &QueueCounters) -> Result<WriteBatchOp, StorageError> {
    Ok(WriteBatchOp::PutCounters {
        key: queue.as_bytes().to_vec(),
        value: serde_json::to_vec(counters)?,
    })
}

/// Pending index key of a message, derived from its record.
pub(super) fn pending_key_of(msg: &Message) -> Vec<u8> {
    keys::pending_key(&msg.queue, msg.priority.score(), msg.created_at, &msg.id)
}

#[cfg(test)]
mod tests;
