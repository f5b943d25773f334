use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use sourced_outbox::{
    headers, BrokerOptions, BrokerTransport, DataStorage, Dispatch, DispatcherConfig, ExchangeKind,
    InMemoryBroker, Message, MessageStatus, Publish, PublishError, StorageError, Transaction,
};

use crate::support::{GatedTransport, OrderCreated, Pipeline};

// ============================================================================
// Persist before delivery
// ============================================================================

#[test]
fn row_is_scheduled_before_the_consumer_runs() {
    let transport = GatedTransport::new();
    let pipeline = Pipeline::new(transport.clone(), DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();

    pipeline
        .publisher
        .publish("orders.created", Message::new(1, json!({"id": 1, "name": "order-1"})))
        .unwrap();
    assert_eq!(pipeline.status(1), Some(MessageStatus::Scheduled));

    transport.release();
    pipeline.dispatcher.stop().unwrap();

    assert_eq!(transport.sent(), vec![1]);
    assert_eq!(pipeline.status(1), Some(MessageStatus::Succeeded));
}

#[test]
fn persistence_failure_is_returned_and_nothing_is_sent() {
    let transport = GatedTransport::new();
    transport.release();
    let pipeline = Pipeline::new(transport.clone(), DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();
    pipeline.storage.fail_next_inserts(1);

    let result = pipeline
        .publisher
        .publish("orders.created", Message::new(2, json!({"id": 2})));

    assert!(matches!(result, Err(PublishError::Persistence(_))));
    pipeline.dispatcher.stop().unwrap();
    assert!(transport.sent().is_empty());
    assert_eq!(pipeline.status(2), None);
}

// ============================================================================
// Caller transactions
// ============================================================================

#[test]
fn order_and_envelope_commit_together() {
    let transport = GatedTransport::new();
    transport.release();
    let pipeline = Pipeline::new(transport.clone(), DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();

    let order = OrderCreated::new(1);
    let tx = pipeline.storage.begin_in_memory_transaction(10).unwrap();
    tx.stage("orders", "1", serde_json::to_value(&order).unwrap()).unwrap();
    assert!(pipeline.publisher.get_tx(10).is_some());

    pipeline
        .publisher
        .publish_payload("orders.created", 10, &order)
        .unwrap();

    // Registry entry is gone and the caller's handle is finished.
    assert!(pipeline.publisher.get_tx(10).is_none());
    assert!(tx.is_finished());
    assert_eq!(pipeline.storage.row("orders", "1"), Some(json!({"id": 1, "name": "order-1"})));

    pipeline.dispatcher.stop().unwrap();
    assert_eq!(pipeline.status(10), Some(MessageStatus::Succeeded));
}

#[test]
fn envelope_insert_failure_rolls_back_the_order() {
    let transport = GatedTransport::new();
    transport.release();
    let pipeline = Pipeline::new(transport.clone(), DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();

    let tx = pipeline.storage.begin_in_memory_transaction(11).unwrap();
    tx.stage("orders", "1", json!({"id": 1, "name": "order-1"})).unwrap();
    pipeline.storage.fail_next_inserts(1);

    let result = pipeline
        .publisher
        .publish("orders.created", Message::new(11, json!({"id": 1, "name": "order-1"})));

    assert!(matches!(result, Err(PublishError::Persistence(_))));
    assert!(pipeline.publisher.get_tx(11).is_none());
    assert!(tx.is_finished());
    assert_eq!(pipeline.storage.row("orders", "1"), None);
    assert_eq!(pipeline.status(11), None);

    pipeline.dispatcher.stop().unwrap();
    assert!(transport.sent().is_empty());
}

#[test]
fn duplicate_id_in_transaction_rolls_back() {
    let transport = GatedTransport::new();
    transport.release();
    let pipeline = Pipeline::new(transport, DispatcherConfig::default());

    pipeline
        .publisher
        .publish("orders.created", Message::new(12, json!({"id": 1})))
        .unwrap();

    let tx = pipeline.storage.begin_in_memory_transaction(12).unwrap();
    tx.stage("orders", "2", json!({"id": 2})).unwrap();
    let result = pipeline
        .publisher
        .publish("orders.created", Message::new(12, json!({"id": 2})));

    assert!(matches!(
        result,
        Err(PublishError::Persistence(StorageError::DuplicateId(12)))
    ));
    assert_eq!(pipeline.storage.row("orders", "2"), None);
    pipeline.dispatcher.stop().unwrap();
}

#[test]
fn explicit_handle_publish() {
    let transport = GatedTransport::new();
    transport.release();
    let pipeline = Pipeline::new(transport.clone(), DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();

    let tx = pipeline.storage.begin_in_memory().unwrap();
    tx.stage("orders", "3", json!({"id": 3})).unwrap();
    pipeline
        .publisher
        .publish_in(tx.as_ref(), "orders.created", Message::new(13, json!({"id": 3})))
        .unwrap();

    assert!(tx.is_finished());
    assert!(matches!(tx.commit(), Err(StorageError::TransactionFinished)));
    assert_eq!(pipeline.storage.row("orders", "3"), Some(json!({"id": 3})));

    pipeline.dispatcher.stop().unwrap();
    assert_eq!(transport.sent(), vec![13]);
    assert_eq!(pipeline.status(13), Some(MessageStatus::Succeeded));
}

#[test]
fn set_tx_registers_an_existing_handle() {
    let pipeline = Pipeline::new(GatedTransport::new(), DispatcherConfig::default());

    let tx = pipeline.storage.begin_in_memory().unwrap();
    pipeline.publisher.set_tx(14, tx.clone());
    assert!(pipeline.publisher.get_tx(14).is_some());

    pipeline
        .publisher
        .publish("orders.created", Message::new(14, json!({})))
        .unwrap();
    assert!(tx.is_finished());
    assert!(pipeline.publisher.get_tx(14).is_none());
    assert!(pipeline.storage.get_tx(14).is_none());
}

// ============================================================================
// End to end over the in-memory broker
// ============================================================================

#[test]
fn concurrent_publishers_deliver_every_message_once() {
    let broker = InMemoryBroker::new();
    let transport = BrokerTransport::new(
        broker.clone(),
        BrokerOptions::default()
            .with_exchange("shop", ExchangeKind::Topic)
            .with_pool_size(2),
    );
    let pipeline = Arc::new(Pipeline::new(transport, DispatcherConfig::default()));
    pipeline.dispatcher.start().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || {
                for n in 0..5 {
                    let id = worker * 100 + n;
                    pipeline
                        .publisher
                        .publish_payload("orders.created", id, &OrderCreated::new(id as u64))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    pipeline.dispatcher.stop().unwrap();

    let deliveries = broker.deliveries_to("orders.created");
    assert_eq!(deliveries.len(), 20);
    let mut ids: Vec<i64> = deliveries
        .iter()
        .map(|d| d.publishing.message_id.parse().unwrap())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 20);

    for id in ids {
        assert_eq!(pipeline.status(id), Some(MessageStatus::Succeeded));
    }
    assert_eq!(pipeline.dispatcher.stats().sent, 20);
}

#[test]
fn delivered_body_decodes_to_the_published_payload() {
    let broker = InMemoryBroker::new();
    let transport = BrokerTransport::new(broker.clone(), BrokerOptions::default())
        .with_publish_timeout(Duration::from_secs(1));
    let pipeline = Pipeline::new(transport, DispatcherConfig::default());
    pipeline.dispatcher.start().unwrap();

    let order = OrderCreated::new(1);
    pipeline
        .publisher
        .publish_payload("orders.created", 21, &order)
        .unwrap();
    pipeline.dispatcher.stop().unwrap();

    let delivery = &broker.deliveries()[0];
    let decoded: OrderCreated = serde_json::from_slice(&delivery.publishing.body).unwrap();
    assert_eq!(decoded, order);

    // Headers travel in the stored content, not on the wire body.
    let row = pipeline
        .storage
        .find_message(&pipeline.storage.published_table(), 21)
        .unwrap()
        .unwrap();
    let stored = row.message().unwrap();
    assert_eq!(stored.header(headers::TYPE), Some("OrderCreated"));
    assert_eq!(stored.decode::<OrderCreated>().unwrap(), order);
}
