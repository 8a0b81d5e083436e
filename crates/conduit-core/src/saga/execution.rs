use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SagaError;
use crate::saga::definition::SagaDefinition;

/// Key/value bag threaded through the steps of one execution.
pub type ExecutionContext = Map<String, Value>;

/// Lifecycle of a saga execution:
/// `started -> processing -> {completed | compensating -> compensated}`,
/// with `failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Started,
    Processing,
    Compensating,
    Completed,
    Failed,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SagaStatus::Started => "started",
            SagaStatus::Processing => "processing",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensated => "compensated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Failed | SagaStatus::Compensated
        )
    }

    pub fn can_transition_to(self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Started, Processing | Compensating) => true,
            (Processing, Processing | Completed | Compensating) => true,
            (Compensating, Compensated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one compensation action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompensationResult {
    Succeeded,
    /// The action failed; the rollback continued with the next step.
    Failed { reason: String },
    /// The step had no compensation to run.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompensationOutcome {
    pub step_index: usize,
    #[serde(flatten)]
    pub result: CompensationResult,
}

/// One running (or finished) instance of a saga definition.
///
/// The context is persisted as its own blob next to the record, so it is
/// skipped when the record itself is serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaExecution {
    pub id: Uuid,
    pub definition_id: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub total_steps: usize,
    /// Forward steps that succeeded, in execution order.
    pub completed_steps: Vec<usize>,
    /// Compensations that succeeded, in the order they ran (descending step index).
    pub compensation_steps_executed: Vec<usize>,
    /// Every compensation attempted or skipped, in the order considered.
    #[serde(default)]
    pub compensation_report: Vec<CompensationOutcome>,
    #[serde(skip)]
    pub context: ExecutionContext,
    pub error: Option<String>,
    pub timeout_ms: u64,
    pub started_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
}

impl SagaExecution {
    pub fn new(
        definition: &SagaDefinition,
        context: ExecutionContext,
        timeout_ms: u64,
        now: u64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: definition.id.clone(),
            status: SagaStatus::Started,
            current_step: 0,
            total_steps: definition.steps.len(),
            completed_steps: Vec::new(),
            compensation_steps_executed: Vec::new(),
            compensation_report: Vec::new(),
            context,
            error: None,
            timeout_ms,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping the update (and completion) time.
    pub fn transition(&mut self, next: SagaStatus, now: u64) -> Result<(), SagaError> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                id: self.id,
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn deadline(&self) -> u64 {
        self.started_at
            .saturating_add(self.timeout_ms.saturating_mul(crate::clock::NANOS_PER_MILLI))
    }

    pub fn merge_context(&mut self, updates: ExecutionContext) {
        self.context.extend(updates);
    }

    pub(crate) fn was_compensation_considered(&self, step_index: usize) -> bool {
        self.compensation_report
            .iter()
            .any(|o| o.step_index == step_index)
    }
}
