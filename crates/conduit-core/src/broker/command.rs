use uuid::Uuid;

use crate::broker::stats::{QueueMetrics, QueueSummary};
use crate::error::QueueError;
use crate::message::{Message, MessageStatus};
use crate::queue::QueueConfig;

type Reply<T> = tokio::sync::oneshot::Sender<Result<T, QueueError>>;

/// Whether `CreateQueue` registered a new queue or found an identical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateQueueStatus {
    Created,
    Exists,
}

impl CreateQueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CreateQueueStatus::Created => "created",
            CreateQueueStatus::Exists => "exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateQueueReceipt {
    pub name: String,
    pub status: CreateQueueStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub id: Uuid,
    pub status: MessageStatus,
    pub queue: String,
    /// Nanoseconds since the Unix epoch.
    pub processed_at: u64,
    pub processing_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteReceipt {
    pub id: Uuid,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailReceipt {
    pub id: Uuid,
    pub status: MessageStatus,
    pub retry_count: Option<u32>,
    pub next_retry_at: Option<u64>,
}

/// Commands sent from callers to the single-threaded scheduler core.
///
/// Every variant except `Shutdown` carries a `tokio::sync::oneshot::Sender`
/// for the reply.
pub enum SchedulerCommand {
    CreateQueue {
        config: QueueConfig,
        reply: Reply<CreateQueueReceipt>,
    },
    SendMessage {
        message: Message,
        reply: Reply<SendReceipt>,
    },
    ReceiveMessage {
        queue: String,
        consumer_id: String,
        reply: Reply<Option<Message>>,
    },
    CompleteMessage {
        queue: String,
        msg_id: Uuid,
        reply: Reply<CompleteReceipt>,
    },
    FailMessage {
        queue: String,
        msg_id: Uuid,
        error: String,
        reply: Reply<FailReceipt>,
    },
    GetMessage {
        msg_id: Uuid,
        reply: Reply<Message>,
    },
    GetQueueMetrics {
        queue: String,
        reply: Reply<QueueMetrics>,
    },
    ListQueues {
        reply: Reply<Vec<QueueSummary>>,
    },
    /// Move up to `count` (0 = all) messages from a dead-letter queue back
    /// to the queues they were dead-lettered from.
    Redrive {
        dlq: String,
        count: u64,
        reply: Reply<u64>,
    },
    Shutdown,
}
