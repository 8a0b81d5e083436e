use super::*;
use crate::broker::metrics::Metrics;
use crate::storage::RocksDbStorage;

#[tokio::test]
async fn abort_policy_fails_without_compensating() {
    let h = harness();
    h.engine
        .define_saga(
            SagaDefinition::new("order", "Order")
                .compensated_step("reserve", op("reserve"), op("release"))
                .step("charge", op("fail"))
                .with_failure_policy(FailurePolicy::Abort),
        )
        .await
        .unwrap();

    let receipt = h
        .engine
        .execute_saga("order", ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(receipt.status, SagaStatus::Failed);

    let exec = h.engine.get_execution(&receipt.execution_id).unwrap();
    assert_eq!(exec.completed_steps, vec![0]);
    assert!(exec.compensation_report.is_empty());
    assert!(exec.error.as_deref().unwrap().contains("step 1 (charge)"));
    assert_eq!(h.operator.operations(), vec!["reserve", "fail"]);
}

#[tokio::test]
async fn retry_policy_redispatches_until_the_step_succeeds() {
    let h = harness();
    h.engine
        .define_saga(
            SagaDefinition::new("order", "Order")
                .step("flaky", op("flaky"))
                .with_failure_policy(FailurePolicy::Retry)
                .with_retry_policy(RetryPolicy {
                    max_attempts: 3,
                    backoff_ms: 1,
                }),
        )
        .await
        .unwrap();

    let receipt = h
        .engine
        .execute_saga("order", ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(receipt.status, SagaStatus::Completed);
    assert_eq!(h.operator.operations(), vec!["flaky", "flaky", "flaky"]);
}

#[tokio::test]
async fn exhausted_retries_fall_back_to_compensation() {
    let h = harness();
    h.engine
        .define_saga(
            SagaDefinition::new("order", "Order")
                .compensated_step("reserve", op("reserve"), op("release"))
                .step("charge", op("fail"))
                .with_failure_policy(FailurePolicy::Retry)
                .with_retry_policy(RetryPolicy {
                    max_attempts: 2,
                    backoff_ms: 1,
                }),
        )
        .await
        .unwrap();

    let receipt = h
        .engine
        .execute_saga("order", ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(receipt.status, SagaStatus::Compensated);
    assert_eq!(
        h.operator.operations(),
        vec!["reserve", "fail", "fail", "release"]
    );
}

#[tokio::test]
async fn storage_fault_mid_run_ends_failed() {
    let dir = tempfile::tempdir().unwrap();
    // One write for the definition and one for the started record.
    let storage = Arc::new(FlakyStorage::new(
        RocksDbStorage::open(dir.path()).unwrap(),
        2,
    ));
    let h = harness_over(storage, Metrics::new());
    h.engine
        .define_saga(SagaDefinition::new("order", "Order").step("reserve", op("reserve")))
        .await
        .unwrap();

    let receipt = h
        .engine
        .execute_saga("order", ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(receipt.status, SagaStatus::Failed);
    assert!(h.operator.calls().is_empty(), "no step runs after the fault");
}
