pub mod command;
pub mod metrics;
mod scheduler;
pub mod stats;

use std::sync::Arc;
use std::thread;

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{BrokerError, BrokerResult, QueueError};
use crate::message::Message;
use crate::queue::QueueConfig;
use crate::storage::Storage;

pub use command::{
    CompleteReceipt, CreateQueueReceipt, CreateQueueStatus, FailReceipt, SchedulerCommand,
    SendReceipt,
};
pub use stats::{QueueMetrics, QueueSummary};

use scheduler::Scheduler;

/// The broker owns the scheduler thread and the inbound command channel.
/// Producers and consumers call the async methods (or `send_command()`
/// directly), and the single-threaded scheduler processes them sequentially.
pub struct Broker {
    command_tx: crossbeam_channel::Sender<SchedulerCommand>,
    scheduler_thread: Option<thread::JoinHandle<()>>,
}

impl Broker {
    /// Create a new broker, spawning the scheduler on a dedicated OS thread.
    #[tracing::instrument(skip_all, fields(data_dir = %config.storage.data_dir))]
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> BrokerResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<SchedulerCommand>(
            config.scheduler.command_channel_capacity,
        );

        let scheduler_config = config.scheduler.clone();
        let retry_config = config.retry.clone();

        let handle = thread::Builder::new()
            .name("conduit-scheduler".to_string())
            .spawn(move || {
                let mut scheduler = Scheduler::new(storage, rx, &scheduler_config, &retry_config);
                scheduler.run();
            })
            .map_err(|e| BrokerError::SchedulerSpawn(e.to_string()))?;

        info!("broker started");

        Ok(Self {
            command_tx: tx,
            scheduler_thread: Some(handle),
        })
    }

    /// Send a command to the scheduler. Returns an error if the channel is full
    /// or disconnected.
    pub fn send_command(&self, cmd: SchedulerCommand) -> BrokerResult<()> {
        self.command_tx.try_send(cmd).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => BrokerError::ChannelFull,
            crossbeam_channel::TrySendError::Disconnected(_) => BrokerError::ChannelDisconnected,
        })
    }

    /// Send a command built around a fresh reply channel and await the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<Result<T, QueueError>>) -> SchedulerCommand,
    ) -> Result<T, QueueError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.send_command(build(reply_tx))?;
        reply_rx.await.map_err(|_| BrokerError::ReplyDropped)?
    }

    #[tracing::instrument(skip_all, fields(queue = %config.name))]
    pub async fn create_queue(&self, config: QueueConfig) -> Result<CreateQueueReceipt, QueueError> {
        self.request(|reply| SchedulerCommand::CreateQueue { config, reply })
            .await
    }

    #[tracing::instrument(skip_all, fields(queue = %message.queue, msg_id = %message.id))]
    pub async fn send_message(&self, message: Message) -> Result<SendReceipt, QueueError> {
        self.request(|reply| SchedulerCommand::SendMessage { message, reply })
            .await
    }

    /// Deliver the highest-priority pending message of `queue`, or `None`
    /// when nothing is deliverable.
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(
        &self,
        queue: &str,
        consumer_id: &str,
    ) -> Result<Option<Message>, QueueError> {
        self.request(|reply| SchedulerCommand::ReceiveMessage {
            queue: queue.to_string(),
            consumer_id: consumer_id.to_string(),
            reply,
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn complete_message(
        &self,
        msg_id: Uuid,
        queue: &str,
    ) -> Result<CompleteReceipt, QueueError> {
        self.request(|reply| SchedulerCommand::CompleteMessage {
            queue: queue.to_string(),
            msg_id,
            reply,
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn fail_message(
        &self,
        msg_id: Uuid,
        queue: &str,
        error: &str,
    ) -> Result<FailReceipt, QueueError> {
        self.request(|reply| SchedulerCommand::FailMessage {
            queue: queue.to_string(),
            msg_id,
            error: error.to_string(),
            reply,
        })
        .await
    }

    pub async fn get_message(&self, msg_id: Uuid) -> Result<Message, QueueError> {
        self.request(|reply| SchedulerCommand::GetMessage { msg_id, reply })
            .await
    }

    pub async fn get_queue_metrics(&self, queue: &str) -> Result<QueueMetrics, QueueError> {
        self.request(|reply| SchedulerCommand::GetQueueMetrics {
            queue: queue.to_string(),
            reply,
        })
        .await
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueSummary>, QueueError> {
        self.request(|reply| SchedulerCommand::ListQueues { reply })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn redrive(&self, dlq: &str, count: u64) -> Result<u64, QueueError> {
        self.request(|reply| SchedulerCommand::Redrive {
            dlq: dlq.to_string(),
            count,
            reply,
        })
        .await
    }

    /// Initiate graceful shutdown: send the shutdown command and wait for the
    /// scheduler thread to finish.
    #[tracing::instrument(skip_all)]
    pub fn shutdown(mut self) -> BrokerResult<()> {
        info!("initiating broker shutdown");

        // Send shutdown command (ignore error if channel already closed)
        let _ = self.command_tx.send(SchedulerCommand::Shutdown);

        // Wait for the scheduler thread to finish
        if let Some(handle) = self.scheduler_thread.take() {
            handle.join().map_err(|_| BrokerError::SchedulerPanicked)?;
        }

        info!("broker shutdown complete");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // If shutdown wasn't called explicitly, attempt to stop the scheduler
        if self.scheduler_thread.is_some() {
            let _ = self.command_tx.send(SchedulerCommand::Shutdown);
            if let Some(handle) = self.scheduler_thread.take() {
                let _ = handle.join();
            }
        }
    }
}
