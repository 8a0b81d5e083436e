use std::sync::Arc;

use uuid::Uuid;

use crate::error::{SagaError, StorageError};
use crate::saga::definition::SagaDefinition;
use crate::saga::execution::SagaExecution;
use crate::storage::{keys, Storage, WriteBatchOp};

/// Saga persistence on top of the shared `Storage`.
///
/// An execution is two records: the execution itself and its context blob.
/// `save` writes both in one batch so a reader never sees a step recorded as
/// completed without the context it produced.
///
/// Async callers use `persist`, which runs the write on the blocking pool.
/// Writes go through `writes` one at a time, in the order they were issued.
#[derive(Clone)]
pub struct SagaStore {
    storage: Arc<dyn Storage>,
    writes: Arc<tokio::sync::Mutex<()>>,
}

impl SagaStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            writes: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn put_definition(&self, def: &SagaDefinition) -> Result<(), SagaError> {
        let value = serde_json::to_vec(def).map_err(StorageError::from)?;
        self.storage.write_batch(vec![WriteBatchOp::PutSagaDefinition {
            key: def.id.as_bytes().to_vec(),
            value,
        }])?;
        Ok(())
    }

    pub fn get_definition(&self, id: &str) -> Result<Option<SagaDefinition>, SagaError> {
        Ok(self.storage.get_saga_definition(id)?)
    }

    pub fn save(&self, exec: &SagaExecution) -> Result<(), SagaError> {
        self.storage.write_batch(execution_ops(exec)?)?;
        Ok(())
    }

    /// `save` on the blocking pool. The write holds the store's write lock
    /// until it lands, so it completes even if the calling future is dropped
    /// and a later `persist` or `load_settled` waits for it.
    pub async fn persist(&self, exec: &SagaExecution) -> Result<(), SagaError> {
        let ops = execution_ops(exec)?;
        let permit = self.writes.clone().lock_owned().await;
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            storage.write_batch(ops)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;
        Ok(())
    }

    /// `load` once every `persist` issued before it has landed.
    pub async fn load_settled(&self, id: &Uuid) -> Result<SagaExecution, SagaError> {
        let _permit = self.writes.lock().await;
        self.load(id)
    }

    /// Execution record with its context merged back in.
    pub fn load(&self, id: &Uuid) -> Result<SagaExecution, SagaError> {
        let mut exec = self
            .storage
            .get_execution(id)?
            .ok_or_else(|| SagaError::ExecutionNotFound(id.to_string()))?;
        exec.context = self.storage.get_execution_context(id)?.unwrap_or_default();
        Ok(exec)
    }

    /// Executions oldest first, optionally restricted to one definition.
    /// Contexts are not loaded.
    pub fn list(&self, definition_id: Option<&str>) -> Result<Vec<SagaExecution>, SagaError> {
        let mut executions: Vec<SagaExecution> = self
            .storage
            .list_executions()?
            .into_iter()
            .filter(|e| definition_id.map_or(true, |d| e.definition_id == d))
            .collect();
        executions.sort_by_key(|e| (e.started_at, e.id));
        Ok(executions)
    }
}

fn execution_ops(exec: &SagaExecution) -> Result<Vec<WriteBatchOp>, StorageError> {
    let key = keys::execution_key(&exec.id);
    Ok(vec![
        WriteBatchOp::PutExecution {
            key: key.clone(),
            value: serde_json::to_vec(exec)?,
        },
        WriteBatchOp::PutExecutionContext {
            key,
            value: serde_json::to_vec(&exec.context)?,
        },
    ])
}
