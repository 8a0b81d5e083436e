use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SagaError;
use crate::message::Priority;

/// What a step (or compensation) does when dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Invoke an external endpoint.
    RemoteCall {
        endpoint: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        body: Value,
    },
    /// Run a named operation against an external data system.
    DataOperation {
        system: String,
        operation: String,
        #[serde(default)]
        params: Value,
    },
    /// Send a command message to a queue.
    MessageSend {
        queue: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        priority: Priority,
    },
    /// Any action type this build does not know. Dispatched as a logged no-op.
    #[serde(other)]
    Unknown,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub action: StepAction,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }
}

/// What the engine does when a forward step fails.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Undo completed steps in reverse order, ending `compensated`.
    #[default]
    Compensate,
    /// Re-dispatch the failing step per the retry policy, then compensate.
    Retry,
    /// Stop immediately, ending `failed` without compensation.
    Abort,
}

/// Re-dispatch budget used by `FailurePolicy::Retry`. The delay doubles after
/// each attempt, starting at `backoff_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        self.backoff_ms.saturating_mul(factor)
    }
}

/// A named workflow: ordered forward steps plus compensations aligned with
/// them by index. `compensations[i]` undoes `steps[i]`; a missing or `null`
/// entry means step `i` has nothing to undo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SagaDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub compensations: Vec<Option<StepSpec>>,
    /// Wall-clock budget of one execution. Falls back to the engine default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl SagaDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            compensations: Vec::new(),
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Append a forward step without compensation.
    pub fn step(mut self, name: impl Into<String>, action: StepAction) -> Self {
        self.steps.push(StepSpec::new(name, action));
        self.compensations.push(None);
        self
    }

    /// Append a forward step together with the action that undoes it.
    pub fn compensated_step(
        mut self,
        name: impl Into<String>,
        action: StepAction,
        compensation: StepAction,
    ) -> Self {
        let name = name.into();
        self.compensations
            .push(Some(StepSpec::new(format!("undo {name}"), compensation)));
        self.steps.push(StepSpec::new(name, action));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn compensation_for(&self, step_index: usize) -> Option<&StepSpec> {
        self.compensations.get(step_index).and_then(Option::as_ref)
    }

    /// Number of steps that carry a compensation.
    pub fn compensation_step_count(&self) -> usize {
        self.compensations.iter().flatten().count()
    }

    pub fn validate(&self) -> Result<(), SagaError> {
        if self.id.trim().is_empty() {
            return Err(SagaError::Validation("saga id must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(SagaError::Validation(format!(
                "saga {} must have at least one step",
                self.id
            )));
        }
        if self.compensations.len() > self.steps.len() {
            return Err(SagaError::Validation(format!(
                "saga {} has {} compensations for {} steps",
                self.id,
                self.compensations.len(),
                self.steps.len()
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(SagaError::Validation(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(SagaError::Validation(
                "retry_policy.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
