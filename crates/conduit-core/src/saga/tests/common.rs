use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::broker::metrics::Metrics;
use crate::config::SagaConfig;
use crate::error::{StepError, StorageError, StorageResult};
use crate::message::Message;
use crate::queue::{QueueConfig, QueueCounters};
use crate::storage::{IndexKind, RocksDbStorage, Storage, WriteBatchOp};

/// One data-operation dispatch as seen by `ScriptedOperator`.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub operation: String,
    pub step_index: usize,
    pub compensating: bool,
    /// Context keys visible to the action, sorted.
    pub context_keys: Vec<String>,
}

/// Data operator whose behaviour is picked by the operation name:
/// `fail` always fails, `flaky` fails its first two calls, `slow` never
/// finishes in test time; anything else succeeds and writes
/// `{operation: step_index}` into the context.
#[derive(Default)]
pub struct ScriptedOperator {
    calls: Mutex<Vec<Call>>,
    flaky_calls: AtomicUsize,
}

impl ScriptedOperator {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.operation).collect()
    }
}

#[async_trait]
impl DataOperator for ScriptedOperator {
    async fn execute(
        &self,
        system: &str,
        operation: &str,
        _params: &Value,
        invocation: StepInvocation<'_>,
    ) -> Result<ExecutionContext, StepError> {
        let mut context_keys: Vec<String> = invocation.context.keys().cloned().collect();
        context_keys.sort();
        self.calls.lock().unwrap().push(Call {
            operation: operation.to_string(),
            step_index: invocation.step_index,
            compensating: invocation.compensating,
            context_keys,
        });

        let failure = || StepError::DataOperation {
            system: system.to_string(),
            operation: operation.to_string(),
            reason: "scripted failure".to_string(),
        };
        match operation {
            "fail" => Err(failure()),
            "flaky" if self.flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 => Err(failure()),
            "slow" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ExecutionContext::new())
            }
            _ => {
                let mut updates = ExecutionContext::new();
                updates.insert(operation.to_string(), json!(invocation.step_index));
                Ok(updates)
            }
        }
    }
}

pub fn op(operation: &str) -> StepAction {
    StepAction::DataOperation {
        system: "test".to_string(),
        operation: operation.to_string(),
        params: Value::Null,
    }
}

pub fn ctx(value: Value) -> ExecutionContext {
    match value {
        Value::Object(map) => map,
        _ => panic!("context must be a JSON object"),
    }
}

pub struct Harness {
    pub engine: SagaEngine,
    pub store: SagaStore,
    pub operator: Arc<ScriptedOperator>,
    _dir: Option<tempfile::TempDir>,
}

pub fn harness() -> Harness {
    harness_with_metrics(Metrics::new())
}

pub fn harness_with_metrics(metrics: Metrics) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(RocksDbStorage::open(dir.path()).unwrap());
    let mut h = harness_over(storage, metrics);
    h._dir = Some(dir);
    h
}

pub fn harness_over(storage: Arc<dyn Storage>, metrics: Metrics) -> Harness {
    let operator = Arc::new(ScriptedOperator::default());
    let dispatcher = StepDispatcher::new().with_data_operator(operator.clone());
    let engine =
        SagaEngine::with_metrics(storage.clone(), dispatcher, &SagaConfig::default(), metrics);
    Harness {
        engine,
        store: SagaStore::new(storage),
        operator,
        _dir: None,
    }
}

/// Poll until `id` reaches a terminal state.
pub async fn wait_terminal(engine: &SagaEngine, id: Uuid) -> SagaExecution {
    for _ in 0..500 {
        let exec = engine.get_execution(&id).unwrap();
        if exec.status.is_terminal() {
            return exec;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {id} did not finish");
}

/// Storage that accepts `budget` write batches and rejects every one after.
pub struct FlakyStorage {
    inner: RocksDbStorage,
    budget: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(inner: RocksDbStorage, budget: usize) -> Self {
        Self {
            inner,
            budget: AtomicUsize::new(budget),
        }
    }
}

impl Storage for FlakyStorage {
    fn get_message(&self, msg_id: &Uuid) -> StorageResult<Option<Message>> {
        self.inner.get_message(msg_id)
    }

    fn first_index_entry(
        &self,
        index: IndexKind,
        prefix: &[u8],
    ) -> StorageResult<Option<Vec<u8>>> {
        self.inner.first_index_entry(index, prefix)
    }

    fn list_index(
        &self,
        index: IndexKind,
        prefix: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<Vec<u8>>> {
        self.inner.list_index(index, prefix, limit)
    }

    fn list_index_up_to(
        &self,
        index: IndexKind,
        prefix: &[u8],
        up_to: &[u8],
    ) -> StorageResult<Vec<Vec<u8>>> {
        self.inner.list_index_up_to(index, prefix, up_to)
    }

    fn get_queue(&self, name: &str) -> StorageResult<Option<QueueConfig>> {
        self.inner.get_queue(name)
    }

    fn list_queues(&self) -> StorageResult<Vec<QueueConfig>> {
        self.inner.list_queues()
    }

    fn get_counters(&self, queue: &str) -> StorageResult<Option<QueueCounters>> {
        self.inner.get_counters(queue)
    }

    fn get_saga_definition(&self, id: &str) -> StorageResult<Option<SagaDefinition>> {
        self.inner.get_saga_definition(id)
    }

    fn get_execution(&self, execution_id: &Uuid) -> StorageResult<Option<SagaExecution>> {
        self.inner.get_execution(execution_id)
    }

    fn get_execution_context(
        &self,
        execution_id: &Uuid,
    ) -> StorageResult<Option<ExecutionContext>> {
        self.inner.get_execution_context(execution_id)
    }

    fn list_executions(&self) -> StorageResult<Vec<SagaExecution>> {
        self.inner.list_executions()
    }

    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let allowed = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(StorageError::RocksDb("injected write failure".to_string()));
        }
        self.inner.write_batch(ops)
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }
}
