use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::metrics::Metrics;
use crate::clock::{self, NANOS_PER_MILLI};
use crate::config::SagaConfig;
use crate::error::{SagaError, StepError};
use crate::saga::definition::{FailurePolicy, SagaDefinition, StepSpec};
use crate::saga::dispatcher::{StepDispatcher, StepInvocation};
use crate::saga::execution::{
    CompensationOutcome, CompensationResult, ExecutionContext, SagaExecution, SagaStatus,
};
use crate::saga::registry::{DefineReceipt, SagaRegistry};
use crate::saga::store::SagaStore;
use crate::storage::Storage;

/// Snapshot returned by `execute_saga` and `start_saga`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionReceipt {
    pub execution_id: Uuid,
    pub status: SagaStatus,
    pub current_step: usize,
    pub total_steps: usize,
}

impl From<&SagaExecution> for ExecutionReceipt {
    fn from(exec: &SagaExecution) -> Self {
        Self {
            execution_id: exec.id,
            status: exec.status,
            current_step: exec.current_step,
            total_steps: exec.total_steps,
        }
    }
}

/// Runs saga executions.
///
/// Steps of one execution run strictly in order, and each step's record and
/// context are persisted in one batch before the next step is dispatched.
/// Different executions run concurrently. Every run is bounded by the
/// definition's timeout measured from `started_at`; `spawn_watchdog` enforces
/// the same bound on persisted executions that no task in this process owns.
#[derive(Clone)]
pub struct SagaEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: SagaRegistry,
    store: SagaStore,
    dispatcher: StepDispatcher,
    metrics: Metrics,
    default_timeout_ms: u64,
    /// Executions currently driven by a task of this engine.
    live: Mutex<HashSet<Uuid>>,
}

/// Removes an execution from the live set when its driver finishes.
struct LiveGuard {
    inner: Arc<EngineInner>,
    id: Uuid,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.inner.live_set().remove(&self.id);
    }
}

impl EngineInner {
    fn live_set(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Why a run stopped short of its own terminal state.
enum RunFault {
    TimedOut,
    Engine(SagaError),
}

impl SagaEngine {
    pub fn new(storage: Arc<dyn Storage>, dispatcher: StepDispatcher, config: &SagaConfig) -> Self {
        Self::with_metrics(storage, dispatcher, config, Metrics::new())
    }

    pub fn with_metrics(
        storage: Arc<dyn Storage>,
        dispatcher: StepDispatcher,
        config: &SagaConfig,
        metrics: Metrics,
    ) -> Self {
        let store = SagaStore::new(storage);
        Self {
            inner: Arc::new(EngineInner {
                registry: SagaRegistry::new(store.clone()),
                store,
                dispatcher,
                metrics,
                default_timeout_ms: config.default_timeout_ms,
                live: Mutex::new(HashSet::new()),
            }),
        }
    }

    #[tracing::instrument(skip_all, fields(saga = %definition.id))]
    pub async fn define_saga(&self, definition: SagaDefinition) -> Result<DefineReceipt, SagaError> {
        self.inner.registry.define(definition).await
    }

    /// Start an execution of `definition_id` and drive it to a terminal state.
    #[tracing::instrument(skip(self, context))]
    pub async fn execute_saga(
        &self,
        definition_id: &str,
        context: ExecutionContext,
    ) -> Result<ExecutionReceipt, SagaError> {
        let (def, exec, guard) = self.begin(definition_id, context).await?;
        let exec = self.drive(&def, exec).await;
        drop(guard);
        Ok(ExecutionReceipt::from(&exec))
    }

    /// Persist a `started` execution and drive it on a spawned task.
    #[tracing::instrument(skip(self, context))]
    pub async fn start_saga(
        &self,
        definition_id: &str,
        context: ExecutionContext,
    ) -> Result<ExecutionReceipt, SagaError> {
        let (def, exec, guard) = self.begin(definition_id, context).await?;
        let receipt = ExecutionReceipt::from(&exec);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.drive(&def, exec).await;
            drop(guard);
        });
        Ok(receipt)
    }

    pub fn get_execution(&self, execution_id: &Uuid) -> Result<SagaExecution, SagaError> {
        self.inner.store.load(execution_id)
    }

    pub fn list_executions(
        &self,
        definition_id: Option<&str>,
    ) -> Result<Vec<SagaExecution>, SagaError> {
        self.inner.store.list(definition_id)
    }

    /// Time out every persisted, non-terminal execution past its deadline
    /// that no task of this engine is driving. Returns how many were handled.
    pub async fn sweep_expired(&self, now: u64) -> Result<usize, SagaError> {
        let candidates: Vec<SagaExecution> = self
            .inner
            .store
            .list(None)?
            .into_iter()
            .filter(|e| !e.status.is_terminal() && e.deadline() <= now)
            .collect();

        let mut handled = 0;
        for candidate in candidates {
            let Some(_guard) = self.claim(candidate.id) else {
                continue;
            };
            let exec = self.inner.store.load_settled(&candidate.id).await?;
            if exec.status.is_terminal() {
                continue;
            }
            let def = self.inner.registry.get(&exec.definition_id).await;
            let exec = match def {
                Ok(def) => self.time_out(&def, exec).await,
                Err(e) => {
                    warn!(execution_id = %exec.id, error = %e, "definition unavailable for expired execution");
                    self.fail(exec, format!("saga timed out; {e}")).await
                }
            };
            self.record_outcome(&exec);
            handled += 1;
        }
        Ok(handled)
    }

    /// Run `sweep_expired` every `interval` until the returned task is aborted.
    pub fn spawn_watchdog(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match engine.sweep_expired(clock::now_ns()).await {
                    Ok(0) => {}
                    Ok(handled) => info!(handled, "watchdog timed out expired saga executions"),
                    Err(e) => warn!(error = %e, "saga watchdog sweep failed"),
                }
            }
        })
    }

    fn claim(&self, id: Uuid) -> Option<LiveGuard> {
        if !self.inner.live_set().insert(id) {
            return None;
        }
        Some(LiveGuard {
            inner: self.inner.clone(),
            id,
        })
    }

    async fn begin(
        &self,
        definition_id: &str,
        context: ExecutionContext,
    ) -> Result<(Arc<SagaDefinition>, SagaExecution, LiveGuard), SagaError> {
        let def = self.inner.registry.get(definition_id).await?;
        let timeout_ms = def.timeout_ms.unwrap_or(self.inner.default_timeout_ms);
        let exec = SagaExecution::new(&def, context, timeout_ms, clock::now_ns());
        let guard = self
            .claim(exec.id)
            .ok_or_else(|| SagaError::Validation(format!("execution {} already running", exec.id)))?;
        self.inner.store.persist(&exec).await?;
        self.inner.metrics.record_saga_started(&def.id);
        info!(execution_id = %exec.id, saga = %def.id, timeout_ms, "saga execution started");
        Ok((def, exec, guard))
    }

    /// Drive `exec` to a terminal state. Never fails: faults end the
    /// execution `failed`.
    async fn drive(&self, def: &SagaDefinition, mut exec: SagaExecution) -> SagaExecution {
        let id = exec.id;
        let remaining = exec.deadline().saturating_sub(clock::now_ns());
        let run = tokio::time::timeout(Duration::from_nanos(remaining), self.run(def, &mut exec));
        let fault = match run.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(RunFault::Engine(e)),
            Err(_elapsed) => Some(RunFault::TimedOut),
        };

        let exec = match fault {
            None => exec,
            Some(RunFault::TimedOut) => match self.inner.store.load_settled(&id).await {
                Ok(persisted) => self.time_out(def, persisted).await,
                Err(e) => self.fail(exec, format!("saga timed out; {e}")).await,
            },
            Some(RunFault::Engine(e)) => {
                error!(execution_id = %id, error = %e, "saga engine fault");
                self.fail(exec, e.to_string()).await
            }
        };
        self.record_outcome(&exec);
        exec
    }

    async fn run(&self, def: &SagaDefinition, exec: &mut SagaExecution) -> Result<(), SagaError> {
        for (idx, step) in def.steps.iter().enumerate().skip(exec.current_step) {
            exec.transition(SagaStatus::Processing, clock::now_ns())?;
            exec.current_step = idx;
            self.inner.store.persist(exec).await?;

            match self.dispatch_with_policy(def, step, idx, exec).await {
                Ok(updates) => {
                    exec.completed_steps.push(idx);
                    exec.merge_context(updates);
                    exec.current_step = idx + 1;
                    exec.updated_at = clock::now_ns();
                    self.inner.store.persist(exec).await?;
                    debug!(execution_id = %exec.id, step_index = idx, step = %step.name, "step completed");
                }
                Err(e) => {
                    let reason = format!("step {idx} ({}) failed: {e}", step.name);
                    warn!(execution_id = %exec.id, step_index = idx, error = %e, "saga step failed");
                    exec.error = Some(reason);
                    if def.failure_policy == FailurePolicy::Abort {
                        exec.transition(SagaStatus::Failed, clock::now_ns())?;
                        self.inner.store.persist(exec).await?;
                        return Ok(());
                    }
                    return self.compensate(def, exec, SagaStatus::Compensated).await;
                }
            }
        }

        exec.current_step = def.steps.len();
        exec.transition(SagaStatus::Completed, clock::now_ns())?;
        self.inner.store.persist(exec).await?;
        Ok(())
    }

    async fn dispatch_with_policy(
        &self,
        def: &SagaDefinition,
        step: &StepSpec,
        idx: usize,
        exec: &SagaExecution,
    ) -> Result<ExecutionContext, StepError> {
        let attempts = match def.failure_policy {
            FailurePolicy::Retry => def.retry_policy.max_attempts.max(1),
            FailurePolicy::Compensate | FailurePolicy::Abort => 1,
        };
        let mut attempt = 1;
        loop {
            let invocation = StepInvocation {
                execution_id: exec.id,
                step_index: idx,
                step_name: &step.name,
                compensating: false,
                context: &exec.context,
            };
            match self.inner.dispatcher.dispatch(step, invocation).await {
                Ok(updates) => return Ok(updates),
                Err(e) if attempt < attempts => {
                    let delay = def.retry_policy.delay_ms(attempt);
                    debug!(
                        execution_id = %exec.id,
                        step_index = idx,
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "retrying saga step"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Undo completed steps in descending order, then move to `terminal`.
    ///
    /// A failing compensation is recorded and logged and the loop moves on.
    /// Steps already present in the report (from an interrupted earlier
    /// pass) are not compensated twice.
    async fn compensate(
        &self,
        def: &SagaDefinition,
        exec: &mut SagaExecution,
        terminal: SagaStatus,
    ) -> Result<(), SagaError> {
        if exec.status != SagaStatus::Compensating {
            exec.transition(SagaStatus::Compensating, clock::now_ns())?;
            self.inner.store.persist(exec).await?;
        }

        let completed: Vec<usize> = exec.completed_steps.iter().rev().copied().collect();
        for idx in completed {
            if exec.was_compensation_considered(idx) {
                continue;
            }
            let result = match def.compensation_for(idx) {
                None => CompensationResult::Skipped,
                Some(action) => {
                    let invocation = StepInvocation {
                        execution_id: exec.id,
                        step_index: idx,
                        step_name: &action.name,
                        compensating: true,
                        context: &exec.context,
                    };
                    match self.inner.dispatcher.dispatch(action, invocation).await {
                        Ok(_) => CompensationResult::Succeeded,
                        Err(e) => {
                            error!(
                                execution_id = %exec.id,
                                step_index = idx,
                                error = %e,
                                "compensation failed, continuing rollback"
                            );
                            self.inner.metrics.record_compensation_failed(&def.id);
                            CompensationResult::Failed {
                                reason: e.to_string(),
                            }
                        }
                    }
                }
            };
            if result == CompensationResult::Succeeded {
                exec.compensation_steps_executed.push(idx);
            }
            exec.compensation_report.push(CompensationOutcome {
                step_index: idx,
                result,
            });
            exec.updated_at = clock::now_ns();
            self.inner.store.persist(exec).await?;
        }

        exec.transition(terminal, clock::now_ns())?;
        self.inner.store.persist(exec).await
    }

    /// Compensate what `exec` completed and end it `failed`.
    async fn time_out(&self, def: &SagaDefinition, mut exec: SagaExecution) -> SagaExecution {
        if exec.status.is_terminal() {
            return exec;
        }
        let reason = format!("saga timed out after {} ms", exec.timeout_ms);
        warn!(execution_id = %exec.id, saga = %def.id, "{reason}");
        exec.error = Some(reason.clone());
        match self.compensate(def, &mut exec, SagaStatus::Failed).await {
            Ok(()) => exec,
            Err(e) => {
                error!(execution_id = %exec.id, error = %e, "compensation after timeout failed");
                self.fail(exec, reason).await
            }
        }
    }

    /// Force `exec` to `failed`. Reachable from any state on an engine
    /// fault, so the transition table is bypassed.
    async fn fail(&self, mut exec: SagaExecution, reason: String) -> SagaExecution {
        let now = clock::now_ns();
        exec.status = SagaStatus::Failed;
        exec.error = Some(reason);
        exec.updated_at = now;
        exec.completed_at = Some(now);
        if let Err(e) = self.inner.store.persist(&exec).await {
            error!(execution_id = %exec.id, error = %e, "failed to persist failed saga execution");
        }
        exec
    }

    fn record_outcome(&self, exec: &SagaExecution) {
        let saga = exec.definition_id.as_str();
        match exec.status {
            SagaStatus::Completed => self.inner.metrics.record_saga_completed(saga),
            SagaStatus::Compensated => self.inner.metrics.record_saga_compensated(saga),
            SagaStatus::Failed => self.inner.metrics.record_saga_failed(saga),
            SagaStatus::Started | SagaStatus::Processing | SagaStatus::Compensating => return,
        }
        info!(
            execution_id = %exec.id,
            saga,
            status = %exec.status,
            completed_steps = exec.completed_steps.len(),
            compensated = exec.compensation_steps_executed.len(),
            elapsed_ms = exec.updated_at.saturating_sub(exec.started_at) / NANOS_PER_MILLI,
            "saga execution finished"
        );
    }
}
