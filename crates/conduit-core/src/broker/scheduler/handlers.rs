use std::time::Instant;

use uuid::Uuid;

use super::*;
use crate::broker::command::{CompleteReceipt, FailReceipt, SendReceipt};
use crate::clock::{NANOS_PER_MILLI, NANOS_PER_SEC};
use crate::message::{
    MessageStatus, CONTENT_TYPE_HEADER, DEFAULT_CONTENT_TYPE, ORIGINAL_QUEUE_HEADER,
    ORIGINAL_RETRY_COUNT_HEADER,
};
use crate::queue::validate_queue_name;
use crate::storage::IndexKind;

impl Scheduler {
    pub(super) fn handle_send(&mut self, mut message: Message) -> Result<SendReceipt, QueueError> {
        let started = Instant::now();
        validate_queue_name(&message.queue)?;
        let config = self.queue_config(&message.queue)?;

        // Check-then-put is safe: the scheduler is the only writer.
        if self.storage.get_message(&message.id)?.is_some() {
            return Err(QueueError::Validation(format!(
                "message id {} already exists",
                message.id
            )));
        }

        let mut counters = self.load_counters(&message.queue)?;
        if let Some(max) = config.max_length {
            if counters.pending >= max {
                return Err(QueueError::QueueFull(message.queue.clone()));
            }
        }

        let now = clock::now_ns();
        if message.expires_at.is_none() {
            if let Some(ttl_ms) = config.message_ttl_ms {
                message.expires_at = Some(
                    message
                        .created_at
                        .saturating_add(ttl_ms.saturating_mul(NANOS_PER_MILLI)),
                );
            }
        }
        message
            .headers
            .entry(CONTENT_TYPE_HEADER.to_string())
            .or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
        message.status = MessageStatus::Pending;
        message.retry_count = 0;
        message.next_retry_at = None;
        message.consumer_id = None;
        message.received_at = None;

        counters.total += 1;
        counters.pending += 1;
        counters.last_activity_at = Some(now);

        let ops = vec![
            put_message_op(&message)?,
            WriteBatchOp::PutIndex {
                index: IndexKind::Pending,
                key: pending_key_of(&message),
            },
        ];
        self.commit(ops, &[(message.queue.as_str(), &counters)])?;
        self.metrics.record_sent(&message.queue);

        Ok(SendReceipt {
            id: message.id,
            status: message.status,
            queue: message.queue,
            processed_at: now,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Pop the highest-priority deliverable message and move it to `processing`.
    ///
    /// Due retries of the queue are promoted first. Expired messages met on
    /// the way are moved to `failed` and skipped.
    pub(super) fn handle_receive(
        &mut self,
        queue: &str,
        consumer_id: &str,
    ) -> Result<Option<Message>, QueueError> {
        self.queue_config(queue)?;
        let now = clock::now_ns();
        self.promote_due_retries_for(queue, now)?;

        let prefix = keys::queue_prefix(queue);
        loop {
            let Some(key) = self.storage.first_index_entry(IndexKind::Pending, &prefix)? else {
                return Ok(None);
            };

            let Some(mut msg) = self.indexed_message(IndexKind::Pending, &key)? else {
                continue;
            };

            let mut counters = self.load_counters(queue)?;
            counters.pending = counters.pending.saturating_sub(1);
            counters.last_activity_at = Some(now);

            if msg.is_expired(now) {
                msg.status = MessageStatus::Failed;
                msg.last_error = Some("message expired".to_string());
                counters.failed += 1;
                let ops = vec![
                    WriteBatchOp::DeleteIndex {
                        index: IndexKind::Pending,
                        key,
                    },
                    put_message_op(&msg)?,
                ];
                self.commit(ops, &[(queue, &counters)])?;
                self.metrics.record_expired(queue);
                debug!(%queue, msg_id = %msg.id, "dropped expired message");
                continue;
            }

            msg.status = MessageStatus::Processing;
            msg.consumer_id = Some(consumer_id.to_string());
            msg.received_at = Some(now);
            counters.processing += 1;

            let ops = vec![
                WriteBatchOp::DeleteIndex {
                    index: IndexKind::Pending,
                    key,
                },
                WriteBatchOp::PutIndex {
                    index: IndexKind::Processing,
                    key: keys::timed_key(queue, now, &msg.id),
                },
                put_message_op(&msg)?,
            ];
            self.commit(ops, &[(queue, &counters)])?;
            self.metrics.record_received(queue);
            return Ok(Some(msg));
        }
    }

    pub(super) fn handle_complete(
        &mut self,
        queue: &str,
        msg_id: &Uuid,
    ) -> Result<CompleteReceipt, QueueError> {
        self.queue_config(queue)?;
        let mut msg = self.message_in_queue(queue, msg_id)?;

        match msg.status {
            MessageStatus::Processing => {}
            MessageStatus::Completed => {
                debug!(%queue, %msg_id, "message already completed");
                return Ok(CompleteReceipt {
                    id: msg.id,
                    status: msg.status,
                });
            }
            other => {
                return Err(QueueError::InvalidTransition {
                    id: msg.id,
                    from: other.to_string(),
                    to: "completed",
                })
            }
        }

        let now = clock::now_ns();
        let processing_key = processing_key_of(&msg)?;
        let mut counters = self.load_counters(queue)?;
        counters.processing = counters.processing.saturating_sub(1);
        counters.completed += 1;
        counters.last_activity_at = Some(now);
        msg.status = MessageStatus::Completed;

        let ops = vec![
            WriteBatchOp::DeleteIndex {
                index: IndexKind::Processing,
                key: processing_key,
            },
            put_message_op(&msg)?,
        ];
        self.commit(ops, &[(queue, &counters)])?;
        self.metrics.record_completed(queue);

        Ok(CompleteReceipt {
            id: msg.id,
            status: msg.status,
        })
    }

    pub(super) fn handle_fail(
        &mut self,
        queue: &str,
        msg_id: &Uuid,
        error: &str,
    ) -> Result<FailReceipt, QueueError> {
        let config = self.queue_config(queue)?;
        let msg = self.message_in_queue(queue, msg_id)?;
        if msg.status != MessageStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: msg.id,
                from: msg.status.to_string(),
                to: "failed",
            });
        }
        self.fail_in_flight(&config, msg, error, clock::now_ns())
    }

    /// Route an in-flight message to the retry index or, once its retry
    /// budget is spent, to dead-letter. Shared by `FailMessage` and the
    /// visibility-timeout reclaim.
    pub(super) fn fail_in_flight(
        &mut self,
        config: &QueueConfig,
        mut msg: Message,
        error: &str,
        now: u64,
    ) -> Result<FailReceipt, QueueError> {
        let queue = config.name.as_str();
        let mut ops = vec![WriteBatchOp::DeleteIndex {
            index: IndexKind::Processing,
            key: processing_key_of(&msg)?,
        }];
        let mut counters = self.load_counters(queue)?;
        counters.processing = counters.processing.saturating_sub(1);
        counters.last_activity_at = Some(now);
        msg.last_error = Some(error.to_string());
        msg.consumer_id = None;
        msg.received_at = None;

        if msg.retry_count < config.retry_limit {
            msg.retry_count += 1;
            let delay_secs = self.retry.backoff_secs(msg.retry_count);
            let next_retry_at = now.saturating_add(delay_secs.saturating_mul(NANOS_PER_SEC));
            msg.status = MessageStatus::Retrying;
            msg.next_retry_at = Some(next_retry_at);
            counters.failed += 1;
            counters.retried += 1;

            ops.push(WriteBatchOp::PutIndex {
                index: IndexKind::Retry,
                key: keys::timed_key(queue, next_retry_at, &msg.id),
            });
            ops.push(put_message_op(&msg)?);
            self.commit(ops, &[(queue, &counters)])?;
            self.metrics.record_retried(queue);
            debug!(
                %queue,
                msg_id = %msg.id,
                retry_count = msg.retry_count,
                delay_secs,
                "scheduled retry"
            );

            return Ok(FailReceipt {
                id: msg.id,
                status: msg.status,
                retry_count: Some(msg.retry_count),
                next_retry_at: Some(next_retry_at),
            });
        }

        let exhausted = msg.retry_count;
        msg.status = MessageStatus::DeadLetter;
        msg.next_retry_at = None;
        counters.dead_letter += 1;

        match config.dead_letter_queue.as_deref() {
            Some(dlq) => {
                let dlq_counters = self.dead_letter_target(dlq, now, &mut ops)?;
                msg.headers
                    .insert(ORIGINAL_QUEUE_HEADER.to_string(), queue.to_string());
                msg.headers
                    .insert(ORIGINAL_RETRY_COUNT_HEADER.to_string(), exhausted.to_string());
                // The retry budget is per queue; the DLQ starts a fresh one.
                msg.retry_count = 0;
                msg.queue = dlq.to_string();
                ops.push(WriteBatchOp::PutIndex {
                    index: IndexKind::Pending,
                    key: pending_key_of(&msg),
                });
                ops.push(put_message_op(&msg)?);
                self.commit(ops, &[(queue, &counters), (dlq, &dlq_counters)])?;
                if !self.queues.contains_key(dlq) {
                    self.queues
                        .insert(dlq.to_string(), QueueConfig::new(dlq.to_string()));
                }
                warn!(%queue, %dlq, msg_id = %msg.id, "message dead-lettered");
            }
            None => {
                ops.push(put_message_op(&msg)?);
                self.commit(ops, &[(queue, &counters)])?;
                warn!(
                    %queue,
                    msg_id = %msg.id,
                    "message dead-lettered, no dead-letter queue configured"
                );
            }
        }
        self.metrics.record_dead_lettered(queue);

        Ok(FailReceipt {
            id: msg.id,
            status: MessageStatus::DeadLetter,
            retry_count: Some(exhausted),
            next_retry_at: None,
        })
    }

    /// Counters of `dlq` after receiving one more message. A dead-letter queue
    /// deleted from storage since its parent was created is re-registered in
    /// the same batch. `max_length` is not checked here.
    fn dead_letter_target(
        &mut self,
        dlq: &str,
        now: u64,
        ops: &mut Vec<WriteBatchOp>,
    ) -> Result<QueueCounters, QueueError> {
        let mut counters = match self.queue_config(dlq) {
            Ok(_) => self.load_counters(dlq)?,
            Err(QueueError::QueueNotFound(_)) => {
                ops.push(put_queue_op(&QueueConfig::new(dlq.to_string()))?);
                QueueCounters::new(now)
            }
            Err(e) => return Err(e),
        };
        counters.total += 1;
        counters.pending += 1;
        counters.last_activity_at = Some(now);
        Ok(counters)
    }

    /// Message record that currently belongs to `queue`.
    pub(super) fn message_in_queue(
        &self,
        queue: &str,
        msg_id: &Uuid,
    ) -> Result<Message, QueueError> {
        match self.storage.get_message(msg_id)? {
            Some(msg) if msg.queue == queue => Ok(msg),
            _ => Err(QueueError::MessageNotFound(msg_id.to_string())),
        }
    }

    /// Resolve an index entry to its message record. Entries that are corrupt
    /// or point at a missing record are removed and yield `None`.
    pub(super) fn indexed_message(
        &self,
        index: IndexKind,
        key: &[u8],
    ) -> Result<Option<Message>, QueueError> {
        let msg = match keys::parse_msg_id(key) {
            Some(id) => self.storage.get_message(&id)?,
            None => None,
        };
        if msg.is_none() {
            warn!(?index, "orphaned index entry, removing");
            self.storage.write_batch(vec![WriteBatchOp::DeleteIndex {
                index,
                key: key.to_vec(),
            }])?;
        }
        Ok(msg)
    }
}

fn processing_key_of(msg: &Message) -> Result<Vec<u8>, StorageError> {
    let received_at = msg.received_at.ok_or_else(|| {
        StorageError::CorruptData(format!("in-flight message {} has no receipt time", msg.id))
    })?;
    Ok(keys::timed_key(&msg.queue, received_at, &msg.id))
}
