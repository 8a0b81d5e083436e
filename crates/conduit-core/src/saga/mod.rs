//! SAGA orchestration: definitions, persisted executions, step dispatch and
//! the engine that drives executions forward or rolls them back.

pub mod definition;
pub mod dispatcher;
pub mod engine;
pub mod execution;
pub mod registry;
pub mod store;

pub use definition::{FailurePolicy, RetryPolicy, SagaDefinition, StepAction, StepSpec};
pub use dispatcher::{
    DataOperator, HttpRemoteCaller, MessagePublisher, RemoteCaller, StepDispatcher,
    StepInvocation,
};
pub use engine::{ExecutionReceipt, SagaEngine};
pub use execution::{
    CompensationOutcome, CompensationResult, ExecutionContext, SagaExecution, SagaStatus,
};
pub use registry::{DefineReceipt, DefineStatus, SagaRegistry};
pub use store::SagaStore;

#[cfg(test)]
mod tests;
