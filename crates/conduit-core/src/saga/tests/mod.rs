use super::*;
use crate::broker::metrics::test_harness::MetricTestHarness;
use crate::clock;
use crate::error::SagaError;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

mod common;
use common::*;

mod execute;
mod policy;
