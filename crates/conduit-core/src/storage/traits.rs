use uuid::Uuid;

use crate::error::StorageResult;
use crate::message::Message;
use crate::queue::{QueueConfig, QueueCounters};
use crate::saga::{ExecutionContext, SagaDefinition, SagaExecution};

/// Per-queue ordered index a message can sit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Ready for delivery, ordered by priority then age.
    Pending,
    /// In flight, ordered by receipt time.
    Processing,
    /// Waiting for a retry, ordered by due time.
    Retry,
}

/// Represents a single operation in an atomic write batch.
#[derive(Debug)]
pub enum WriteBatchOp {
    PutMessage { key: Vec<u8>, value: Vec<u8> },
    PutIndex { index: IndexKind, key: Vec<u8> },
    DeleteIndex { index: IndexKind, key: Vec<u8> },
    PutQueue { key: Vec<u8>, value: Vec<u8> },
    PutCounters { key: Vec<u8>, value: Vec<u8> },
    PutSagaDefinition { key: Vec<u8>, value: Vec<u8> },
    PutExecution { key: Vec<u8>, value: Vec<u8> },
    PutExecutionContext { key: Vec<u8>, value: Vec<u8> },
}

/// Storage trait for all persistence operations. Implementations must be thread-safe.
///
/// Reads are single-key or ordered prefix scans; every mutation goes through
/// `write_batch`, which applies all of its operations atomically.
pub trait Storage: Send + Sync {
    // --- Message records ---

    fn get_message(&self, msg_id: &Uuid) -> StorageResult<Option<Message>>;

    // --- Queue indexes ---

    /// First key (lowest sort order) of `index` starting with `prefix`.
    fn first_index_entry(&self, index: IndexKind, prefix: &[u8])
        -> StorageResult<Option<Vec<u8>>>;

    /// Up to `limit` keys of `index` starting with `prefix`, in key order.
    fn list_index(&self, index: IndexKind, prefix: &[u8], limit: usize)
        -> StorageResult<Vec<Vec<u8>>>;

    /// Keys of `index` starting with `prefix` and sorting `<= up_to`.
    fn list_index_up_to(
        &self,
        index: IndexKind,
        prefix: &[u8],
        up_to: &[u8],
    ) -> StorageResult<Vec<Vec<u8>>>;

    // --- Queue configuration and counters ---

    fn get_queue(&self, name: &str) -> StorageResult<Option<QueueConfig>>;

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>>;

    fn get_counters(&self, queue: &str) -> StorageResult<Option<QueueCounters>>;

    // --- Sagas ---

    fn get_saga_definition(&self, id: &str) -> StorageResult<Option<SagaDefinition>>;

    /// Execution record without its context blob.
    fn get_execution(&self, execution_id: &Uuid) -> StorageResult<Option<SagaExecution>>;

    fn get_execution_context(&self, execution_id: &Uuid)
        -> StorageResult<Option<ExecutionContext>>;

    /// All execution records (without context blobs).
    fn list_executions(&self) -> StorageResult<Vec<SagaExecution>>;

    // --- Batch operations ---

    /// Atomically apply a batch of write operations across column families.
    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()>;

    /// Flush the write-ahead log to disk.
    fn flush(&self) -> StorageResult<()>;
}
