use uuid::Uuid;

use super::*;
use crate::broker::command::{CreateQueueReceipt, CreateQueueStatus};
use crate::broker::stats::{QueueMetrics, QueueSummary};
use crate::message::{MessageStatus, ORIGINAL_QUEUE_HEADER, ORIGINAL_RETRY_COUNT_HEADER};
use crate::storage::IndexKind;

impl Scheduler {
    pub(super) fn handle_create_queue(
        &mut self,
        config: QueueConfig,
    ) -> Result<CreateQueueReceipt, QueueError> {
        config.validate()?;

        // Check-then-put is safe: the scheduler is single-threaded, so no
        // concurrent command can create the same queue between the check and
        // the put.
        match self.queue_config(&config.name) {
            Ok(existing) if existing == config => {
                debug!(queue = %config.name, "queue already exists with identical configuration");
                return Ok(CreateQueueReceipt {
                    name: config.name,
                    status: CreateQueueStatus::Exists,
                });
            }
            Ok(_) => return Err(QueueError::QueueConflict(config.name)),
            Err(QueueError::QueueNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let now = clock::now_ns();
        let mut ops = vec![put_queue_op(&config)?];
        let counters = QueueCounters::new(now);

        // A dead-letter queue is an ordinary direct queue, created alongside
        // its parent when it does not exist yet.
        let mut dlq_config = None;
        if let Some(dlq) = config.dead_letter_queue.as_deref() {
            match self.queue_config(dlq) {
                Ok(_) => {}
                Err(QueueError::QueueNotFound(_)) => {
                    let dlq = QueueConfig::new(dlq.to_string());
                    ops.push(put_queue_op(&dlq)?);
                    dlq_config = Some(dlq);
                }
                Err(e) => return Err(e),
            }
        }

        match &dlq_config {
            Some(dlq) => self.commit(
                ops,
                &[
                    (config.name.as_str(), &counters),
                    (dlq.name.as_str(), &counters),
                ],
            )?,
            None => self.commit(ops, &[(config.name.as_str(), &counters)])?,
        }

        if let Some(dlq) = dlq_config {
            debug!(queue = %config.name, dlq = %dlq.name, "auto-created dead-letter queue");
            self.queues.insert(dlq.name.clone(), dlq);
        }
        let name = config.name.clone();
        self.queues.insert(name.clone(), config);
        info!(queue = %name, "queue created");

        Ok(CreateQueueReceipt {
            name,
            status: CreateQueueStatus::Created,
        })
    }

    pub(super) fn handle_get_message(&self, msg_id: &Uuid) -> Result<Message, QueueError> {
        self.storage
            .get_message(msg_id)?
            .ok_or_else(|| QueueError::MessageNotFound(msg_id.to_string()))
    }

    pub(super) fn handle_get_queue_metrics(
        &mut self,
        queue: &str,
    ) -> Result<QueueMetrics, QueueError> {
        self.queue_config(queue)?;
        let counters = self.load_counters(queue)?;
        Ok(QueueMetrics::from_counters(queue, &counters, clock::now_ns()))
    }

    pub(super) fn handle_list_queues(&self) -> Result<Vec<QueueSummary>, QueueError> {
        let now = clock::now_ns();
        self.storage
            .list_queues()?
            .into_iter()
            .map(|config| {
                let counters = self.load_counters(&config.name)?;
                let metrics = QueueMetrics::from_counters(&config.name, &counters, now);
                Ok(QueueSummary { config, metrics })
            })
            .collect()
    }

    /// Move dead-lettered messages back to the queue named in their
    /// `x-original-queue` header, oldest-highest-priority first. Messages
    /// without the header (sent to the dead-letter queue directly) stay put.
    pub(super) fn handle_redrive(&mut self, dlq: &str, count: u64) -> Result<u64, QueueError> {
        self.queue_config(dlq)?;
        let limit = if count == 0 { u64::MAX } else { count };

        let entries = self
            .storage
            .list_index(IndexKind::Pending, &keys::queue_prefix(dlq), usize::MAX)?;

        let now = clock::now_ns();
        let mut moved = 0u64;
        for key in entries {
            if moved >= limit {
                break;
            }
            let Some(mut msg) = self.indexed_message(IndexKind::Pending, &key)? else {
                continue;
            };
            let Some(origin) = msg.headers.get(ORIGINAL_QUEUE_HEADER).cloned() else {
                debug!(%dlq, msg_id = %msg.id, "message has no original queue, skipping");
                continue;
            };
            match self.queue_config(&origin) {
                Ok(_) => {}
                Err(QueueError::QueueNotFound(_)) => {
                    warn!(
                        %dlq,
                        %origin,
                        msg_id = %msg.id,
                        "original queue no longer exists, skipping"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut dlq_counters = self.load_counters(dlq)?;
            dlq_counters.pending = dlq_counters.pending.saturating_sub(1);
            dlq_counters.last_activity_at = Some(now);
            let mut origin_counters = self.load_counters(&origin)?;
            origin_counters.dead_letter = origin_counters.dead_letter.saturating_sub(1);
            origin_counters.pending += 1;
            origin_counters.last_activity_at = Some(now);

            msg.headers.remove(ORIGINAL_QUEUE_HEADER);
            msg.headers.remove(ORIGINAL_RETRY_COUNT_HEADER);
            msg.queue = origin.clone();
            msg.status = MessageStatus::Pending;
            msg.retry_count = 0;
            msg.next_retry_at = None;
            msg.last_error = None;

            let ops = vec![
                WriteBatchOp::DeleteIndex {
                    index: IndexKind::Pending,
                    key,
                },
                WriteBatchOp::PutIndex {
                    index: IndexKind::Pending,
                    key: pending_key_of(&msg),
                },
                put_message_op(&msg)?,
            ];
            self.commit(
                ops,
                &[(dlq, &dlq_counters), (origin.as_str(), &origin_counters)],
            )?;
            moved += 1;
        }

        info!(%dlq, moved, "redrive complete");
        Ok(moved)
    }
}
