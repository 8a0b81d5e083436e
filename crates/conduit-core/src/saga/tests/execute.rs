use super::*;

fn three_steps() -> SagaDefinition {
    SagaDefinition::new("order", "Order fulfilment")
        .compensated_step("reserve", op("reserve"), op("release"))
        .compensated_step("charge", op("charge"), op("refund"))
        .step("ship", op("ship"))
}

#[tokio::test]
async fn happy_path_completes_every_step() {
    let h = harness();
    h.engine.define_saga(three_steps()).await.unwrap();

    let receipt = h
        .engine
        .execute_saga("order", ctx(json!({"order_id": "o-1"})))
        .await
        .unwrap();
    assert_eq!(receipt.status, SagaStatus::Completed);
    assert_eq!(receipt.current_step, 3);
    assert_eq!(receipt.total_steps, 3);

    let exec = h.engine.get_execution(&receipt.execution_id).unwrap();
    assert_eq!(exec.completed_steps, vec![0, 1, 2]);
    assert!(exec.compensation_steps_executed.is_empty());
    assert!(exec.compensation_report.is_empty());
    assert!(exec.error.is_none());
    assert!(exec.completed_at.is_some());
    assert_eq!(exec.context["order_id"], "o-1");
    assert_eq!(exec.context["reserve"], 0);
    assert_eq!(exec.context["ship"], 2);
    assert_eq!(h.operator.operations(), vec!["reserve", "charge", "ship"]);
}

#[tokio::test]
async fn each_step_sees_context_of_the_steps_before_it() {
    let h = harness();
    h.engine.define_saga(three_steps()).await.unwrap();
    h.engine
        .execute_saga("order", ctx(json!({"order_id": "o-1"})))
        .await
        .unwrap();

    let seen: Vec<Vec<String>> = h.operator.calls().into_iter().map(|c| c.context_keys).collect();
    assert_eq!(
        seen,
        vec![
            vec!["order_id".to_string()],
            vec!["order_id".to_string(), "reserve".to_string()],
            vec![
                "charge".to_string(),
                "order_id".to_string(),
                "reserve".to_string()
            ],
        ]
    );
}

#[tokio::test]
async fn unknown_definition_is_not_found() {
    let h = harness();
    let err = h
        .engine
        .execute_saga("missing", ExecutionContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::DefinitionNotFound(_)));
    assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let h = harness();
    let err = h.engine.get_execution(&Uuid::now_v7()).unwrap_err();
    assert!(matches!(err, SagaError::ExecutionNotFound(_)));
}

#[tokio::test]
async fn define_saga_reports_counts_and_rejects_conflicts() {
    let h = harness();
    let receipt = h.engine.define_saga(three_steps()).await.unwrap();
    assert_eq!(receipt.step_count, 3);
    assert_eq!(receipt.compensation_step_count, 2);

    let err = h
        .engine
        .define_saga(three_steps().with_timeout_ms(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::DefinitionConflict(_)));
}

#[tokio::test]
async fn start_saga_returns_before_the_run_finishes() {
    let h = harness();
    h.engine.define_saga(three_steps()).await.unwrap();

    let receipt = h
        .engine
        .start_saga("order", ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(receipt.status, SagaStatus::Started);
    assert_eq!(receipt.current_step, 0);

    let exec = wait_terminal(&h.engine, receipt.execution_id).await;
    assert_eq!(exec.status, SagaStatus::Completed);
    assert_eq!(exec.current_step, 3);
}

#[tokio::test]
async fn list_executions_filters_by_definition() {
    let h = harness();
    h.engine.define_saga(three_steps()).await.unwrap();
    h.engine
        .define_saga(SagaDefinition::new("audit", "Audit").step("log", op("log")))
        .await
        .unwrap();

    let first = h.engine.execute_saga("order", ExecutionContext::new()).await.unwrap();
    let second = h.engine.execute_saga("order", ExecutionContext::new()).await.unwrap();
    h.engine.execute_saga("audit", ExecutionContext::new()).await.unwrap();

    let orders: Vec<Uuid> = h
        .engine
        .list_executions(Some("order"))
        .unwrap()
        .iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(orders, vec![first.execution_id, second.execution_id]);
    assert_eq!(h.engine.list_executions(None).unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_executions_run_independently() {
    let h = harness();
    h.engine.define_saga(three_steps()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .execute_saga("order", ctx(json!({ "n": i })))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let receipt = handle.await.unwrap();
        assert_eq!(receipt.status, SagaStatus::Completed);
        let exec = h.engine.get_execution(&receipt.execution_id).unwrap();
        assert_eq!(exec.completed_steps, vec![0, 1, 2]);
    }
    assert_eq!(h.operator.calls().len(), 24);
}

#[tokio::test]
async fn outcome_counters_are_labelled_by_saga() {
    let harness_metrics = MetricTestHarness::new();
    let h = harness_with_metrics(harness_metrics.metrics.clone());
    h.engine.define_saga(three_steps()).await.unwrap();
    h.engine.execute_saga("order", ExecutionContext::new()).await.unwrap();
    h.engine.execute_saga("order", ExecutionContext::new()).await.unwrap();

    assert_eq!(
        harness_metrics.counter("conduit.sagas.started", "saga", "order"),
        Some(2)
    );
    assert_eq!(
        harness_metrics.counter("conduit.sagas.completed", "saga", "order"),
        Some(2)
    );
    assert_eq!(
        harness_metrics.counter("conduit.sagas.failed", "saga", "order"),
        None
    );
}
