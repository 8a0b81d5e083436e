use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{QueueError, StepError};
use crate::message::{Message, MessageKind, Priority, CONTENT_TYPE_HEADER};
use crate::saga::definition::{StepAction, StepSpec};
use crate::saga::execution::ExecutionContext;

/// Which step of which execution an action is dispatched for.
#[derive(Debug, Clone, Copy)]
pub struct StepInvocation<'a> {
    pub execution_id: Uuid,
    pub step_index: usize,
    pub step_name: &'a str,
    /// True when the action undoes `step_index` rather than performing it.
    pub compensating: bool,
    pub context: &'a ExecutionContext,
}

/// Performs `remote_call` actions.
#[async_trait]
pub trait RemoteCaller: Send + Sync {
    async fn call(
        &self,
        endpoint: &str,
        method: &str,
        body: &Value,
        invocation: StepInvocation<'_>,
    ) -> Result<ExecutionContext, StepError>;
}

/// Performs `data_operation` actions against an external data system.
#[async_trait]
pub trait DataOperator: Send + Sync {
    async fn execute(
        &self,
        system: &str,
        operation: &str,
        params: &Value,
        invocation: StepInvocation<'_>,
    ) -> Result<ExecutionContext, StepError>;
}

/// Accepts the messages produced by `message_send` actions.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: Message) -> Result<Uuid, QueueError>;
}

#[async_trait]
impl MessagePublisher for Broker {
    async fn publish(&self, message: Message) -> Result<Uuid, QueueError> {
        Ok(self.send_message(message).await?.id)
    }
}

/// `RemoteCaller` over HTTP.
///
/// The request body carries the invocation and the action's own body; a JSON
/// object response is merged into the execution context as-is, any other JSON
/// value lands under `response`.
pub struct HttpRemoteCaller {
    client: Client,
}

impl HttpRemoteCaller {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteCaller for HttpRemoteCaller {
    async fn call(
        &self,
        endpoint: &str,
        method: &str,
        body: &Value,
        invocation: StepInvocation<'_>,
    ) -> Result<ExecutionContext, StepError> {
        let remote_err = |reason: String| StepError::Remote {
            endpoint: endpoint.to_string(),
            reason,
        };
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| remote_err(format!("invalid method {method}")))?;

        let request = json!({
            "execution_id": invocation.execution_id,
            "step_index": invocation.step_index,
            "step": invocation.step_name,
            "compensating": invocation.compensating,
            "context": invocation.context,
            "body": body,
        });
        let response = self
            .client
            .request(method, endpoint)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| remote_err(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| remote_err(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(ExecutionContext::new());
        }
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| remote_err(format!("invalid response body: {e}")))?;
        Ok(response_updates(value))
    }
}

fn response_updates(value: Value) -> ExecutionContext {
    match value {
        Value::Object(map) => map,
        Value::Null => ExecutionContext::new(),
        other => {
            let mut updates = ExecutionContext::new();
            updates.insert("response".to_string(), other);
            updates
        }
    }
}

/// Routes each step action to the collaborator that performs it.
///
/// Collaborators are optional; dispatching an action whose collaborator is
/// missing fails the step with `StepError::Unavailable`.
#[derive(Clone, Default)]
pub struct StepDispatcher {
    remote: Option<Arc<dyn RemoteCaller>>,
    data: Option<Arc<dyn DataOperator>>,
    publisher: Option<Arc<dyn MessagePublisher>>,
}

impl StepDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote_caller(mut self, remote: Arc<dyn RemoteCaller>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_data_operator(mut self, data: Arc<dyn DataOperator>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn MessagePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run `step`, returning the context updates it produced.
    pub async fn dispatch(
        &self,
        step: &StepSpec,
        invocation: StepInvocation<'_>,
    ) -> Result<ExecutionContext, StepError> {
        debug!(
            execution_id = %invocation.execution_id,
            step_index = invocation.step_index,
            step = %step.name,
            compensating = invocation.compensating,
            "dispatching step action"
        );
        match &step.action {
            StepAction::RemoteCall {
                endpoint,
                method,
                body,
            } => {
                let remote = self
                    .remote
                    .as_ref()
                    .ok_or(StepError::Unavailable("remote caller"))?;
                remote.call(endpoint, method, body, invocation).await
            }
            StepAction::DataOperation {
                system,
                operation,
                params,
            } => {
                let data = self
                    .data
                    .as_ref()
                    .ok_or(StepError::Unavailable("data operator"))?;
                data.execute(system, operation, params, invocation).await
            }
            StepAction::MessageSend {
                queue,
                payload,
                priority,
            } => self.send(queue, payload, *priority, invocation).await,
            StepAction::Unknown => {
                warn!(
                    execution_id = %invocation.execution_id,
                    step_index = invocation.step_index,
                    step = %step.name,
                    "unknown step action type, treating as a no-op"
                );
                Ok(ExecutionContext::new())
            }
        }
    }

    async fn send(
        &self,
        queue: &str,
        payload: &Value,
        priority: Priority,
        invocation: StepInvocation<'_>,
    ) -> Result<ExecutionContext, StepError> {
        let publisher = self
            .publisher
            .as_ref()
            .ok_or(StepError::Unavailable("message publisher"))?;
        let message = Message::new(queue, MessageKind::Command, payload.to_string().into_bytes())
            .with_priority(priority)
            .with_header(CONTENT_TYPE_HEADER, "application/json")
            .with_correlation_id(invocation.execution_id.to_string());

        let id = publisher.publish(message).await?;
        let mut updates = ExecutionContext::new();
        updates.insert("message_id".to_string(), Value::String(id.to_string()));
        Ok(updates)
    }
}
