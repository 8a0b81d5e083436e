use super::*;
use crate::config::{RetryConfig, SchedulerConfig};
use crate::message::{MessageKind, MessageStatus, Priority};
use crate::storage::{IndexKind, RocksDbStorage};
use uuid::Uuid;

mod common;
use common::*;

mod dlq;
