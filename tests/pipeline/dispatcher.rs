use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use sourced_outbox::{
    Dispatch, DispatchError, Dispatcher, DispatcherConfig, DispatcherState, Envelope, InMemoryStorage, Message,
    MessageStatus, Publish,
};

use crate::support::{wait_until, FlakyTransport, GatedTransport, Pipeline};

fn envelope(id: i64) -> Envelope {
    Envelope::for_message("orders.created", &Message::new(id, json!({"id": id})), "v1").unwrap()
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn full_never_draining_queue_times_out_and_row_stays_scheduled() {
    let transport = GatedTransport::new();
    let timeout = Duration::from_millis(100);
    let pipeline = Pipeline::new(
        transport.clone(),
        DispatcherConfig::new()
            .with_queue_capacity(1)
            .with_enqueue_timeout(timeout)
            .with_backoff(Duration::from_millis(10)),
    );
    pipeline.dispatcher.start().unwrap();

    // 1 is held by the consumer at the gate, 2 fills the queue.
    pipeline.publisher.publish("orders.created", Message::new(1, json!({}))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || transport.entered() == 1));
    pipeline.publisher.publish("orders.created", Message::new(2, json!({}))).unwrap();

    let started = Instant::now();
    pipeline.publisher.publish("orders.created", Message::new(3, json!({}))).unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    assert_eq!(pipeline.dispatcher.stats().enqueue_timeouts, 1);

    transport.release();
    pipeline.dispatcher.stop().unwrap();

    assert_eq!(transport.sent(), vec![1, 2]);
    assert_eq!(pipeline.status(1), Some(MessageStatus::Succeeded));
    assert_eq!(pipeline.status(2), Some(MessageStatus::Succeeded));
    assert_eq!(pipeline.status(3), Some(MessageStatus::Scheduled));
}

#[test]
fn queue_admits_at_most_its_capacity() {
    let storage = InMemoryStorage::new();
    let dispatcher = Dispatcher::new(
        GatedTransport::new(),
        Arc::new(storage),
        DispatcherConfig::new()
            .with_queue_capacity(3)
            .with_enqueue_timeout(Duration::from_millis(30))
            .with_backoff(Duration::from_millis(5)),
    );

    for id in 1..=3 {
        dispatcher.enqueue_to_publish(envelope(id)).unwrap();
    }
    assert!(matches!(
        dispatcher.enqueue_to_publish(envelope(4)),
        Err(DispatchError::EnqueueTimeout { id: 4, .. })
    ));
    dispatcher.stop().unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn stop_drains_everything_admitted() {
    let transport = GatedTransport::new();
    let pipeline = Arc::new(Pipeline::new(transport.clone(), DispatcherConfig::default()));
    pipeline.dispatcher.start().unwrap();
    for id in 1..=5 {
        pipeline.publisher.publish("orders.created", Message::new(id, json!({}))).unwrap();
    }

    let stopper = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || pipeline.dispatcher.stop())
    };
    assert!(wait_until(Duration::from_secs(2), || {
        pipeline.dispatcher.state() == DispatcherState::Stopping
    }));
    transport.release();
    stopper.join().unwrap().unwrap();

    assert_eq!(transport.sent(), vec![1, 2, 3, 4, 5]);
    for id in 1..=5 {
        assert_eq!(pipeline.status(id), Some(MessageStatus::Succeeded));
    }
    assert_eq!(pipeline.dispatcher.state(), DispatcherState::Stopped);
}

#[test]
fn concurrent_and_repeated_stops_terminate_once() {
    let transport = GatedTransport::new();
    transport.release();
    let pipeline = Arc::new(Pipeline::new(transport.clone(), DispatcherConfig::default()));
    pipeline.dispatcher.start().unwrap();
    pipeline.publisher.publish("orders.created", Message::new(1, json!({}))).unwrap();

    let stoppers: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.dispatcher.stop())
        })
        .collect();
    for stopper in stoppers {
        stopper.join().unwrap().unwrap();
    }
    pipeline.dispatcher.stop().unwrap();

    assert_eq!(transport.closed(), 1);
    assert_eq!(transport.sent(), vec![1]);
}

#[test]
fn stopped_dispatcher_rejects_enqueue_but_publish_still_persists() {
    let transport = GatedTransport::new();
    let pipeline = Pipeline::new(transport, DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();
    pipeline.dispatcher.stop().unwrap();

    assert!(matches!(
        pipeline.dispatcher.enqueue_to_publish(envelope(7)),
        Err(DispatchError::Stopped)
    ));
    pipeline.publisher.publish("orders.created", Message::new(8, json!({}))).unwrap();
    assert_eq!(pipeline.status(8), Some(MessageStatus::Scheduled));
}

// ============================================================================
// Delivery failures
// ============================================================================

#[test]
fn failed_send_leaves_the_row_scheduled() {
    let transport = FlakyTransport::new(1);
    let pipeline = Pipeline::new(transport.clone(), DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();

    pipeline.publisher.publish("orders.created", Message::new(1, json!({}))).unwrap();
    pipeline.publisher.publish("orders.created", Message::new(2, json!({}))).unwrap();
    pipeline.dispatcher.stop().unwrap();

    assert_eq!(pipeline.status(1), Some(MessageStatus::Scheduled));
    assert_eq!(pipeline.status(2), Some(MessageStatus::Succeeded));
    let stats = pipeline.dispatcher.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.sent, 1);
}

#[test]
fn retries_until_success_marks_succeeded() {
    let transport = FlakyTransport::new(2);
    let pipeline = Pipeline::new(
        transport.clone(),
        DispatcherConfig::new()
            .with_max_send_attempts(3)
            .with_retry_backoff(Duration::from_millis(5)),
    );
    pipeline.dispatcher.start().unwrap();

    pipeline.publisher.publish("orders.created", Message::new(1, json!({}))).unwrap();
    pipeline.dispatcher.stop().unwrap();

    assert_eq!(transport.attempts(), 3);
    assert_eq!(transport.sent(), vec![1]);
    assert_eq!(pipeline.status(1), Some(MessageStatus::Succeeded));
    assert_eq!(pipeline.dispatcher.stats().failed, 0);
}
