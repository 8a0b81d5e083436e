/// Low-level storage errors (RocksDB, serialization).
/// This is the error type for the `Storage` trait; storage operations can only
/// fail with infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised by the broker plumbing between callers and the scheduler thread.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to spawn scheduler thread: {0}")]
    SchedulerSpawn(String),

    #[error("scheduler command channel is full")]
    ChannelFull,

    #[error("scheduler command channel is disconnected")]
    ChannelDisconnected,

    #[error("scheduler dropped the reply channel")]
    ReplyDropped,

    #[error("scheduler thread panicked")]
    SchedulerPanicked,
}

/// Caller-visible error category shared by every public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The queue, message, saga definition, or execution does not exist.
    NotFound,
    /// The request was malformed and was rejected before any mutation.
    Validation,
    /// Any other failure inside an operation; the message carries the cause.
    BusinessLogic,
}

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("queue already exists with a different configuration: {0}")]
    QueueConflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("queue is full: {0}")]
    QueueFull(String),

    #[error("message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: uuid::Uuid,
        from: String,
        to: &'static str,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::QueueNotFound(_) | QueueError::MessageNotFound(_) => ErrorKind::NotFound,
            QueueError::QueueConflict(_)
            | QueueError::Validation(_)
            | QueueError::InvalidTransition { .. } => ErrorKind::Validation,
            QueueError::QueueFull(_) | QueueError::Storage(_) | QueueError::Broker(_) => {
                ErrorKind::BusinessLogic
            }
        }
    }
}

/// Errors from saga registry and engine operations.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("saga execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("saga definition already registered with different content: {0}")]
    DefinitionConflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("saga execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: uuid::Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SagaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::DefinitionNotFound(_) | SagaError::ExecutionNotFound(_) => {
                ErrorKind::NotFound
            }
            SagaError::DefinitionConflict(_) | SagaError::Validation(_) => ErrorKind::Validation,
            SagaError::InvalidTransition { .. } | SagaError::Storage(_) => {
                ErrorKind::BusinessLogic
            }
        }
    }
}

/// Failure of a single dispatched saga step or compensation action.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("remote call to {endpoint} failed: {reason}")]
    Remote { endpoint: String, reason: String },

    #[error("data operation {operation} on {system} failed: {reason}")]
    DataOperation {
        system: String,
        operation: String,
        reason: String,
    },

    #[error("message send failed: {0}")]
    MessageSend(#[from] QueueError),

    #[error("no {0} configured for this dispatcher")]
    Unavailable(&'static str),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
