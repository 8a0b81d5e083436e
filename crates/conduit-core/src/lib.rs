pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod saga;
pub mod storage;
pub mod telemetry;

pub use broker::{Broker, QueueMetrics, QueueSummary};
pub use config::Config;
pub use error::{
    BrokerError, ErrorKind, QueueError, SagaError, StepError, StorageError, StorageResult,
};
pub use message::{Message, MessageKind, MessageStatus, Priority};
pub use queue::QueueConfig;
pub use saga::{SagaDefinition, SagaEngine, SagaExecution, SagaStatus, StepDispatcher};
pub use storage::{RocksDbStorage, Storage, WriteBatchOp};
