use super::*;
use crate::message::{ORIGINAL_QUEUE_HEADER, ORIGINAL_RETRY_COUNT_HEADER};

#[test]
fn dead_lettered_message_lands_in_dlq_pending_with_origin_header() {
    let (_tx, mut scheduler, _dir) = test_setup();
    create_queue(&mut scheduler, no_retry_queue("orders")).unwrap();

    let msg_id = dead_letter_one(&mut scheduler, "orders");

    assert_eq!(index_ids(&scheduler, IndexKind::Pending, "orders.dlq"), vec![msg_id]);
    assert!(index_ids(&scheduler, IndexKind::Processing, "orders").is_empty());

    let record = stored(&scheduler, &msg_id);
    assert_eq!(record.queue, "orders.dlq");
    assert_eq!(record.status, MessageStatus::DeadLetter);
    assert_eq!(
        record.headers.get(ORIGINAL_QUEUE_HEADER).map(String::as_str),
        Some("orders")
    );
    assert_eq!(record.last_error.as_deref(), Some("handler crashed"));
}

#[test]
fn dead_letter_updates_counters_of_both_queues() {
    let (_tx, mut scheduler, _dir) = test_setup();
    create_queue(&mut scheduler, no_retry_queue("orders")).unwrap();
    dead_letter_one(&mut scheduler, "orders");

    let origin = queue_metrics(&mut scheduler, "orders");
    assert_eq!(origin.total, 1);
    assert_eq!(origin.processing, 0);
    assert_eq!(origin.dead_letter, 1);
    assert_bucket_invariant(&origin);

    let dlq = queue_metrics(&mut scheduler, "orders.dlq");
    assert_eq!(dlq.total, 1);
    assert_eq!(dlq.pending, 1);
    assert_bucket_invariant(&dlq);
}

#[test]
fn dead_letter_without_dlq_keeps_record_out_of_every_index() {
    let (_tx, mut scheduler, _dir) = test_setup();
    create_queue(&mut scheduler, QueueConfig::new("solo").with_retry_limit(0)).unwrap();

    let msg_id = dead_letter_one(&mut scheduler, "solo");

    for index in [IndexKind::Pending, IndexKind::Processing, IndexKind::Retry] {
        assert!(index_ids(&scheduler, index, "solo").is_empty());
    }
    let record = stored(&scheduler, &msg_id);
    assert_eq!(record.queue, "solo");
    assert_eq!(record.status, MessageStatus::DeadLetter);
    assert_eq!(queue_metrics(&mut scheduler, "solo").dead_letter, 1);
}

#[test]
fn dlq_messages_can_be_consumed_like_any_queue() {
    let (_tx, mut scheduler, _dir) = test_setup();
    create_queue(&mut scheduler, no_retry_queue("orders")).unwrap();
    let msg_id = dead_letter_one(&mut scheduler, "orders");

    let received = receive(&mut scheduler, "orders.dlq").unwrap();
    assert_eq!(received.id, msg_id);
    complete(&mut scheduler, "orders.dlq", msg_id).unwrap();

    let dlq = queue_metrics(&mut scheduler, "orders.dlq");
    assert_eq!(dlq.completed, 1);
    assert_eq!(dlq.pending, 0);
}

#[test]
fn dlq_is_recreated_when_missing_at_dead_letter_time() {
    let (_tx, mut scheduler, _dir) = test_setup();

    // Persist a queue whose dead-letter queue was never registered
    let config = no_retry_queue("legacy");
    scheduler
        .storage()
        .write_batch(vec![put_queue_op(&config).unwrap()])
        .unwrap();
    let msg_id = dead_letter_one(&mut scheduler, "legacy");

    assert!(scheduler.storage().get_queue("legacy.dlq").unwrap().is_some());
    assert_eq!(index_ids(&scheduler, IndexKind::Pending, "legacy.dlq"), vec![msg_id]);
    assert_eq!(queue_metrics(&mut scheduler, "legacy.dlq").pending, 1);
}

#[test]
fn dead_lettered_message_starts_a_fresh_retry_budget_in_the_dlq() {
    let (_tx, mut scheduler, _dir) = test_setup();
    create_queue(
        &mut scheduler,
        QueueConfig::new("orders")
            .with_retry_limit(5)
            .with_dead_letter_queue("orders.dlq"),
    )
    .unwrap();
    let msg_id = send(&mut scheduler, test_message("orders")).unwrap().id;

    for _ in 0..5 {
        receive(&mut scheduler, "orders").unwrap();
        let receipt = fail(&mut scheduler, "orders", msg_id, "handler crashed").unwrap();
        assert_eq!(receipt.status, MessageStatus::Retrying);
        scheduler.promote_due_retries(receipt.next_retry_at.unwrap());
    }
    receive(&mut scheduler, "orders").unwrap();
    let receipt = fail(&mut scheduler, "orders", msg_id, "handler crashed").unwrap();
    assert_eq!(receipt.status, MessageStatus::DeadLetter);
    assert_eq!(receipt.retry_count, Some(5));

    let record = stored(&scheduler, &msg_id);
    assert_eq!(record.queue, "orders.dlq");
    assert_eq!(record.retry_count, 0);
    assert!(record.next_retry_at.is_none());
    assert_eq!(
        record.headers.get(ORIGINAL_RETRY_COUNT_HEADER).map(String::as_str),
        Some("5")
    );

    // The auto-created DLQ has the default limit of 3; a failure there retries
    let received = receive(&mut scheduler, "orders.dlq").unwrap();
    assert_eq!(received.id, msg_id);
    let receipt = fail(&mut scheduler, "orders.dlq", msg_id, "still broken").unwrap();
    assert_eq!(receipt.status, MessageStatus::Retrying);
    assert_eq!(receipt.retry_count, Some(1));
    assert_eq!(index_ids(&scheduler, IndexKind::Retry, "orders.dlq"), vec![msg_id]);
    assert_bucket_invariant(&queue_metrics(&mut scheduler, "orders.dlq"));
}

#[test]
fn dead_lettering_is_not_refused_by_a_full_dlq() {
    let (_tx, mut scheduler, _dir) = test_setup();
    create_queue(&mut scheduler, QueueConfig::new("orders.dlq").with_max_length(1)).unwrap();
    create_queue(&mut scheduler, no_retry_queue("orders")).unwrap();

    let first = dead_letter_one(&mut scheduler, "orders");
    let second = dead_letter_one(&mut scheduler, "orders");

    let mut parked = index_ids(&scheduler, IndexKind::Pending, "orders.dlq");
    parked.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(parked, expected);
    assert_eq!(queue_metrics(&mut scheduler, "orders.dlq").pending, 2);

    // Producers still see the cap
    let err = send(&mut scheduler, test_message("orders.dlq")).unwrap_err();
    assert!(matches!(err, QueueError::QueueFull(_)));
}
