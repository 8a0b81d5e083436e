use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// How producers address a queue. Routing itself is done by the integration
/// processors in front of the queue; the core only stores the declaration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    #[default]
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl FromStr for RoutingKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(RoutingKind::Direct),
            "topic" => Ok(RoutingKind::Topic),
            "fanout" => Ok(RoutingKind::Fanout),
            "headers" => Ok(RoutingKind::Headers),
            other => Err(QueueError::Validation(format!(
                "unsupported channel type: {other}"
            ))),
        }
    }
}

/// Queue configuration stored in the `queues` column family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub routing: RoutingKind,
    #[serde(default = "default_durable")]
    pub durable: bool,
    /// Pending-message cap checked by `SendMessage`. Dead-lettering into
    /// this queue is never refused, so a dead-letter queue can exceed it.
    #[serde(default)]
    pub max_length: Option<u64>,
    #[serde(default)]
    pub message_ttl_ms: Option<u64>,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_prefetch")]
    pub prefetch: u32,
    #[serde(default)]
    pub routing_patterns: Vec<String>,
    /// In-flight messages older than this are reclaimed as failed. `None` disables reclaim.
    #[serde(default)]
    pub visibility_timeout_ms: Option<u64>,
}

fn default_durable() -> bool {
    true
}

fn default_retry_limit() -> u32 {
    QueueConfig::DEFAULT_RETRY_LIMIT
}

fn default_prefetch() -> u32 {
    1
}

impl QueueConfig {
    pub const DEFAULT_RETRY_LIMIT: u32 = 3;

    /// Upper bound on queue name length (names are length-prefixed in storage keys).
    pub const MAX_NAME_LEN: usize = 255;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing: RoutingKind::Direct,
            durable: true,
            max_length: None,
            message_ttl_ms: None,
            dead_letter_queue: None,
            retry_limit: Self::DEFAULT_RETRY_LIMIT,
            prefetch: 1,
            routing_patterns: Vec::new(),
            visibility_timeout_ms: None,
        }
    }

    pub fn with_dead_letter_queue(mut self, dlq: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(dlq.into());
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_message_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_visibility_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.visibility_timeout_ms = Some(timeout_ms);
        self
    }

    /// Reject malformed configurations before anything is persisted.
    pub fn validate(&self) -> Result<(), QueueError> {
        validate_queue_name(&self.name)?;
        if let Some(dlq) = &self.dead_letter_queue {
            validate_queue_name(dlq)?;
            if dlq == &self.name {
                return Err(QueueError::Validation(format!(
                    "queue {} cannot be its own dead-letter queue",
                    self.name
                )));
            }
        }
        if self.max_length == Some(0) {
            return Err(QueueError::Validation(
                "max_length must be greater than zero".to_string(),
            ));
        }
        if matches!(self.routing, RoutingKind::Topic | RoutingKind::Headers)
            && self.routing_patterns.is_empty()
        {
            return Err(QueueError::Validation(format!(
                "{:?} routing requires at least one routing pattern",
                self.routing
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty() {
        return Err(QueueError::Validation(
            "queue name must not be empty".to_string(),
        ));
    }
    if name.len() > QueueConfig::MAX_NAME_LEN {
        return Err(QueueError::Validation(format!(
            "queue name exceeds {} bytes",
            QueueConfig::MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Persisted per-queue counters. Every message of a queue sits in exactly one
/// of the `pending`, `processing`, `completed`, `failed` or `dead_letter`
/// buckets, so their sum never exceeds `total`. `failed` holds messages that
/// failed and are waiting for a retry, plus messages that expired.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounters {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: u64,
    /// Monotonic number of retry schedulings.
    pub retried: u64,
    pub created_at: u64,
    pub last_activity_at: Option<u64>,
}

impl QueueCounters {
    pub fn new(created_at: u64) -> Self {
        Self {
            created_at,
            ..Self::default()
        }
    }
}
