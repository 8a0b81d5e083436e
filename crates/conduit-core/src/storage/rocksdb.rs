use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::message::Message;
use crate::queue::{QueueConfig, QueueCounters};
use crate::saga::{ExecutionContext, SagaDefinition, SagaExecution};
use crate::storage::keys;
use crate::storage::traits::{IndexKind, Storage, WriteBatchOp};

const CF_MESSAGES: &str = "messages";
const CF_PENDING: &str = "pending";
const CF_PROCESSING: &str = "processing";
const CF_RETRY: &str = "retry";
const CF_QUEUES: &str = "queues";
const CF_COUNTERS: &str = "counters";
const CF_SAGAS: &str = "sagas";
const CF_EXECUTIONS: &str = "saga_executions";
const CF_CONTEXTS: &str = "saga_contexts";

/// All column family names (excluding `default` which RocksDB creates automatically).
const COLUMN_FAMILIES: &[&str] = &[
    CF_MESSAGES,
    CF_PENDING,
    CF_PROCESSING,
    CF_RETRY,
    CF_QUEUES,
    CF_COUNTERS,
    CF_SAGAS,
    CF_EXECUTIONS,
    CF_CONTEXTS,
];

type DB = DBWithThreadMode<MultiThreaded>;

fn index_cf(index: IndexKind) -> &'static str {
    match index {
        IndexKind::Pending => CF_PENDING,
        IndexKind::Processing => CF_PROCESSING,
        IndexKind::Retry => CF_RETRY,
    }
}

/// RocksDB-backed storage implementation.
pub struct RocksDbStorage {
    db: DB,
}

impl RocksDbStorage {
    /// Open or create a RocksDB database at the given path with all column families.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> StorageResult<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(&self, cf_name: &str) -> StorageResult<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    /// Iterate index keys under `prefix` until `stop` returns true or `limit` is reached.
    fn scan_index(
        &self,
        index: IndexKind,
        prefix: &[u8],
        limit: usize,
        stop: impl Fn(&[u8]) -> bool,
    ) -> StorageResult<Vec<Vec<u8>>> {
        let cf = self.cf(index_cf(index))?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut results = Vec::new();
        for item in iter {
            if results.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(prefix) || stop(&key) {
                break;
            }
            results.push(key.to_vec());
        }
        Ok(results)
    }
}

impl Storage for RocksDbStorage {
    fn get_message(&self, msg_id: &Uuid) -> StorageResult<Option<Message>> {
        self.get_json(CF_MESSAGES, &keys::message_key(msg_id))
    }

    fn first_index_entry(
        &self,
        index: IndexKind,
        prefix: &[u8],
    ) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.scan_index(index, prefix, 1, |_| false)?.into_iter().next())
    }

    fn list_index(
        &self,
        index: IndexKind,
        prefix: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<Vec<u8>>> {
        self.scan_index(index, prefix, limit, |_| false)
    }

    fn list_index_up_to(
        &self,
        index: IndexKind,
        prefix: &[u8],
        up_to: &[u8],
    ) -> StorageResult<Vec<Vec<u8>>> {
        self.scan_index(index, prefix, usize::MAX, |key| key > up_to)
    }

    fn get_queue(&self, name: &str) -> StorageResult<Option<QueueConfig>> {
        self.get_json(CF_QUEUES, name.as_bytes())
    }

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>> {
        self.scan_json(CF_QUEUES)
    }

    fn get_counters(&self, queue: &str) -> StorageResult<Option<QueueCounters>> {
        self.get_json(CF_COUNTERS, queue.as_bytes())
    }

    fn get_saga_definition(&self, id: &str) -> StorageResult<Option<SagaDefinition>> {
        self.get_json(CF_SAGAS, id.as_bytes())
    }

    fn get_execution(&self, execution_id: &Uuid) -> StorageResult<Option<SagaExecution>> {
        self.get_json(CF_EXECUTIONS, &keys::execution_key(execution_id))
    }

    fn get_execution_context(
        &self,
        execution_id: &Uuid,
    ) -> StorageResult<Option<ExecutionContext>> {
        self.get_json(CF_CONTEXTS, &keys::execution_key(execution_id))
    }

    fn list_executions(&self) -> StorageResult<Vec<SagaExecution>> {
        self.scan_json(CF_EXECUTIONS)
    }

    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let mut batch = WriteBatch::default();

        for op in ops {
            let (cf_name, key, value) = match op {
                WriteBatchOp::PutMessage { key, value } => (CF_MESSAGES, key, Some(value)),
                WriteBatchOp::PutIndex { index, key } => (index_cf(index), key, Some(Vec::new())),
                WriteBatchOp::DeleteIndex { index, key } => (index_cf(index), key, None),
                WriteBatchOp::PutQueue { key, value } => (CF_QUEUES, key, Some(value)),
                WriteBatchOp::PutCounters { key, value } => (CF_COUNTERS, key, Some(value)),
                WriteBatchOp::PutSagaDefinition { key, value } => (CF_SAGAS, key, Some(value)),
                WriteBatchOp::PutExecution { key, value } => (CF_EXECUTIONS, key, Some(value)),
                WriteBatchOp::PutExecutionContext { key, value } => {
                    (CF_CONTEXTS, key, Some(value))
                }
            };
            let cf = self.cf(cf_name)?;
            match value {
                Some(value) => batch.put_cf(&cf, &key, &value),
                None => batch.delete_cf(&cf, &key),
            }
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}
