use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::error::QueueError;

/// Header carrying the declared payload content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Header recording the queue a dead-lettered message came from.
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";

/// Header recording the retry count a message reached before dead-lettering.
pub const ORIGINAL_RETRY_COUNT_HEADER: &str = "x-original-retry-count";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Delivery priority. Higher priorities are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric sort key for the pending index.
    pub fn score(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(QueueError::Validation(format!(
                "unsupported priority: {other}"
            ))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Command,
    Event,
    Query,
    Reply,
}

impl FromStr for MessageKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "command" => Ok(MessageKind::Command),
            "event" => Ok(MessageKind::Event),
            "query" => Ok(MessageKind::Query),
            "reply" => Ok(MessageKind::Reply),
            other => Err(QueueError::Validation(format!(
                "unsupported message kind: {other}"
            ))),
        }
    }
}

/// Lifecycle status of a message record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Retrying,
    DeadLetter,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Retrying => "retrying",
            MessageStatus::DeadLetter => "dead_letter",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core message record. The payload is opaque to the queue: it is stored and
/// returned byte-for-byte, and only the `content-type` header describes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub queue: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub routing_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<u64>,
    pub consumer_id: Option<String>,
    pub received_at: Option<u64>,
    pub last_error: Option<String>,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    /// Build a pending message for `queue` with default priority and no expiry.
    pub fn new(queue: impl Into<String>, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            id: Self::new_id(),
            kind,
            queue: queue.into(),
            payload,
            priority: Priority::default(),
            correlation_id: None,
            reply_to: None,
            routing_key: None,
            headers: HashMap::new(),
            created_at: clock::now_ns(),
            expires_at: None,
            status: MessageStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            consumer_id: None,
            received_at: None,
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at_ns: u64) -> Self {
        self.expires_at = Some(expires_at_ns);
        self
    }

    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ns)
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE_HEADER)
            .map(String::as_str)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}
