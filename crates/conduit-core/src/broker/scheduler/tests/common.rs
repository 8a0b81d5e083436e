use super::*;
use crate::broker::command::{CompleteReceipt, CreateQueueReceipt, FailReceipt, SendReceipt};
use crate::broker::stats::QueueMetrics;

pub(super) fn test_setup() -> (
    crossbeam_channel::Sender<SchedulerCommand>,
    Scheduler,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
    let (tx, scheduler) = test_setup_with_storage(storage);
    (tx, scheduler, dir)
}

/// Helper: create a scheduler sharing an existing storage (for restart tests).
pub(super) fn test_setup_with_storage(
    storage: Arc<dyn Storage>,
) -> (crossbeam_channel::Sender<SchedulerCommand>, Scheduler) {
    let config = SchedulerConfig {
        command_channel_capacity: 256,
        idle_timeout_ms: 10,
    };
    let (tx, rx) = crossbeam_channel::bounded(config.command_channel_capacity);
    let scheduler = Scheduler::new(storage, rx, &config, &RetryConfig::default());
    (tx, scheduler)
}

pub(super) fn test_message(queue: &str) -> Message {
    Message::new(queue, MessageKind::Command, vec![1, 2, 3])
}

/// Helper: a queue whose first failure dead-letters into `{name}.dlq`.
pub(super) fn no_retry_queue(name: &str) -> QueueConfig {
    QueueConfig::new(name)
        .with_retry_limit(0)
        .with_dead_letter_queue(format!("{name}.dlq"))
}

pub(super) fn create_queue(
    scheduler: &mut Scheduler,
    config: QueueConfig,
) -> Result<CreateQueueReceipt, QueueError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::CreateQueue {
        config,
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap()
}

pub(super) fn send(scheduler: &mut Scheduler, message: Message) -> Result<SendReceipt, QueueError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::SendMessage {
        message,
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap()
}

pub(super) fn receive(scheduler: &mut Scheduler, queue: &str) -> Option<Message> {
    try_receive(scheduler, queue).unwrap()
}

pub(super) fn try_receive(
    scheduler: &mut Scheduler,
    queue: &str,
) -> Result<Option<Message>, QueueError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::ReceiveMessage {
        queue: queue.to_string(),
        consumer_id: "test-consumer".to_string(),
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap()
}

pub(super) fn complete(
    scheduler: &mut Scheduler,
    queue: &str,
    msg_id: Uuid,
) -> Result<CompleteReceipt, QueueError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::CompleteMessage {
        queue: queue.to_string(),
        msg_id,
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap()
}

pub(super) fn fail(
    scheduler: &mut Scheduler,
    queue: &str,
    msg_id: Uuid,
    error: &str,
) -> Result<FailReceipt, QueueError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::FailMessage {
        queue: queue.to_string(),
        msg_id,
        error: error.to_string(),
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap()
}

pub(super) fn queue_metrics(scheduler: &mut Scheduler, queue: &str) -> QueueMetrics {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::GetQueueMetrics {
        queue: queue.to_string(),
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap().unwrap()
}

pub(super) fn redrive(scheduler: &mut Scheduler, dlq: &str, count: u64) -> Result<u64, QueueError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    scheduler.handle_command(SchedulerCommand::Redrive {
        dlq: dlq.to_string(),
        count,
        reply: reply_tx,
    });
    reply_rx.blocking_recv().unwrap()
}

/// Helper: message ids in one of a queue's indexes, in index order.
pub(super) fn index_ids(scheduler: &Scheduler, index: IndexKind, queue: &str) -> Vec<Uuid> {
    scheduler
        .storage()
        .list_index(index, &keys::queue_prefix(queue), usize::MAX)
        .unwrap()
        .iter()
        .filter_map(|key| keys::parse_msg_id(key))
        .collect()
}

pub(super) fn stored(scheduler: &Scheduler, msg_id: &Uuid) -> Message {
    scheduler.storage().get_message(msg_id).unwrap().unwrap()
}

/// Helper: send, receive and fail one message on a `no_retry_queue`, leaving
/// it in the dead-letter queue. Returns its id.
pub(super) fn dead_letter_one(scheduler: &mut Scheduler, queue: &str) -> Uuid {
    let msg_id = send(scheduler, test_message(queue)).unwrap().id;
    let received = receive(scheduler, queue).expect("message should be deliverable");
    assert_eq!(received.id, msg_id);
    let receipt = fail(scheduler, queue, msg_id, "handler crashed").unwrap();
    assert_eq!(receipt.status, MessageStatus::DeadLetter);
    msg_id
}

/// The bucket counters of a queue never exceed its total.
pub(super) fn assert_bucket_invariant(metrics: &QueueMetrics) {
    let buckets = metrics.pending
        + metrics.processing
        + metrics.completed
        + metrics.failed
        + metrics.dead_letter;
    assert!(
        buckets <= metrics.total,
        "buckets {buckets} exceed total {} for {}",
        metrics.total,
        metrics.queue
    );
    let expected = metrics.failed as f64 / metrics.total.max(1) as f64 * 100.0;
    assert!((metrics.error_rate - expected).abs() < f64::EPSILON);
}
