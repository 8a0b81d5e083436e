use super::*;
use crate::clock::NANOS_PER_MILLI;
use crate::message::MessageStatus;
use crate::storage::IndexKind;

impl Scheduler {
    /// Warm the queue cache from storage and promote retries that fell due
    /// while the scheduler was down.
    pub(super) fn recover(&mut self) {
        match self.storage.list_queues() {
            Ok(queues) => {
                for config in queues {
                    self.queues.insert(config.name.clone(), config);
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to load queue configurations during recovery");
                return;
            }
        }

        let now = clock::now_ns();
        let promoted = self.promote_due_retries(now);
        let reclaimed = self.reclaim_visibility_timeouts(now);
        info!(
            queues = self.queues.len(),
            promoted, reclaimed, "recovery complete"
        );
    }

    /// Move every retry-index entry due at `now` back to `pending`, across all
    /// queues. Returns the number of messages promoted.
    pub(super) fn promote_due_retries(&mut self, now: u64) -> u64 {
        let queues: Vec<String> = self.queues.keys().cloned().collect();
        let mut promoted = 0;
        for queue in queues {
            match self.promote_due_retries_for(&queue, now) {
                Ok(n) => promoted += n,
                Err(e) => warn!(%queue, error = %e, "failed to promote due retries"),
            }
        }
        if promoted > 0 {
            debug!(promoted, "promoted due retries");
        }
        promoted
    }

    pub(super) fn promote_due_retries_for(
        &mut self,
        queue: &str,
        now: u64,
    ) -> Result<u64, QueueError> {
        let due = self.storage.list_index_up_to(
            IndexKind::Retry,
            &keys::queue_prefix(queue),
            &keys::timed_upper_bound(queue, now),
        )?;

        let mut promoted = 0;
        for key in due {
            let Some(mut msg) = self.indexed_message(IndexKind::Retry, &key)? else {
                continue;
            };
            if msg.status != MessageStatus::Retrying {
                warn!(
                    %queue,
                    msg_id = %msg.id,
                    status = %msg.status,
                    "stale retry entry, removing"
                );
                self.storage.write_batch(vec![WriteBatchOp::DeleteIndex {
                    index: IndexKind::Retry,
                    key,
                }])?;
                continue;
            }

            let mut counters = self.load_counters(queue)?;
            counters.failed = counters.failed.saturating_sub(1);
            counters.pending += 1;

            msg.status = MessageStatus::Pending;
            msg.next_retry_at = None;

            let ops = vec![
                WriteBatchOp::DeleteIndex {
                    index: IndexKind::Retry,
                    key,
                },
                WriteBatchOp::PutIndex {
                    index: IndexKind::Pending,
                    key: pending_key_of(&msg),
                },
                put_message_op(&msg)?,
            ];
            self.commit(ops, &[(queue, &counters)])?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Fail every in-flight message held longer than its queue's visibility
    /// timeout, as if the consumer had called `FailMessage`.
    pub(super) fn reclaim_visibility_timeouts(&mut self, now: u64) -> u64 {
        let configs: Vec<QueueConfig> = self
            .queues
            .values()
            .filter(|c| c.visibility_timeout_ms.is_some())
            .cloned()
            .collect();

        let mut reclaimed = 0;
        for config in configs {
            let Some(timeout_ms) = config.visibility_timeout_ms else {
                continue;
            };
            let cutoff = now.saturating_sub(timeout_ms.saturating_mul(NANOS_PER_MILLI));
            let stale = match self.storage.list_index_up_to(
                IndexKind::Processing,
                &keys::queue_prefix(&config.name),
                &keys::timed_upper_bound(&config.name, cutoff),
            ) {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(queue = %config.name, error = %e, "failed to scan in-flight messages");
                    continue;
                }
            };

            for key in stale {
                let msg = match self.indexed_message(IndexKind::Processing, &key) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(queue = %config.name, error = %e, "failed to read in-flight message");
                        continue;
                    }
                };
                let msg_id = msg.id;
                if msg.status != MessageStatus::Processing {
                    warn!(queue = %config.name, %msg_id, "stale in-flight entry, removing");
                    if let Err(e) = self.storage.write_batch(vec![WriteBatchOp::DeleteIndex {
                        index: IndexKind::Processing,
                        key,
                    }]) {
                        warn!(
                            queue = %config.name,
                            %msg_id,
                            error = %e,
                            "failed to remove stale in-flight entry"
                        );
                    }
                    continue;
                }
                match self.fail_in_flight(&config, msg, "visibility timeout expired", now) {
                    Ok(receipt) => {
                        debug!(
                            queue = %config.name,
                            %msg_id,
                            status = %receipt.status,
                            "reclaimed in-flight message"
                        );
                        reclaimed += 1;
                    }
                    Err(e) => warn!(
                        queue = %config.name,
                        %msg_id,
                        error = %e,
                        "failed to reclaim in-flight message"
                    ),
                }
            }
        }

        if reclaimed > 0 {
            info!(reclaimed, "reclaimed in-flight messages past visibility timeout");
        }
        reclaimed
    }
}
