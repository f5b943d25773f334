use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::json;
use sourced_outbox::{
    BrokerOptions, BrokerTransport, ChannelPool, ConnectionError, DataStorage, DeliveryMode, Dispatch, DispatchError,
    DispatcherConfig, ExchangeKind, InMemoryBroker, Message, MessageStatus, OutboxOptions, Publish, Publishing, Transport,
};

use crate::support::Pipeline;

fn publishing(id: usize) -> Publishing {
    Publishing {
        content_type: "text/plain".to_string(),
        delivery_mode: DeliveryMode::Persistent,
        message_id: id.to_string(),
        body: format!(r#"{{"id":{id}}}"#).into_bytes(),
    }
}

#[test]
fn occupancy_stays_within_capacity_under_contention() {
    let broker = InMemoryBroker::new();
    let pool = Arc::new(ChannelPool::new(
        broker.clone(),
        BrokerOptions::default().with_pool_size(3),
    ));
    let barrier = Arc::new(Barrier::new(8));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                barrier.wait();
                for n in 0..25 {
                    let mut channel = pool.rent().unwrap();
                    assert!(!channel.is_closed());
                    channel
                        .publish("orders.created", &publishing(worker * 100 + n), Duration::from_secs(1))
                        .unwrap();
                    drop(channel);
                    max_seen.fetch_max(pool.occupancy(), Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(max_seen.load(Ordering::SeqCst) <= 3);
    assert!(pool.occupancy() <= 3);
    assert_eq!(broker.deliveries().len(), 200);
    assert_eq!(broker.connections_opened(), 1);
}

#[test]
fn broken_channels_are_replaced_transparently() {
    let broker = InMemoryBroker::new();
    let pool = ChannelPool::new(broker.clone(), BrokerOptions::default().with_pool_size(4));

    for round in 0..3 {
        let channels: Vec<_> = (0..4).map(|_| pool.rent().unwrap()).collect();
        drop(channels);
        broker.close_channels();
        let channel = pool.rent().unwrap();
        assert!(!channel.is_closed(), "round {round}");
    }
}

#[test]
fn dispatcher_stop_disposes_the_broker_pool() {
    let broker = InMemoryBroker::new();
    let outbox = OutboxOptions::default().with_version("v2");
    let transport = Arc::new(BrokerTransport::new(
        broker.clone(),
        BrokerOptions::default()
            .with_exchange("shop", ExchangeKind::Topic)
            .with_outbox(outbox.clone()),
    ));
    let pipeline = Pipeline::with_options(transport.clone(), DispatcherConfig::default(), outbox);
    pipeline.dispatcher.start().unwrap();

    pipeline
        .publisher
        .publish("orders.created", Message::new(1, json!({"id": 1})))
        .unwrap();
    pipeline.dispatcher.stop().unwrap();

    let row = pipeline
        .storage
        .find_message(&pipeline.storage.published_table(), 1)
        .unwrap()
        .unwrap();
    assert_eq!(broker.deliveries()[0].exchange, format!("shop.{}", row.version));
    assert_eq!(row.version, "v2");
    assert_eq!(pipeline.status(1), Some(MessageStatus::Succeeded));
    assert!(transport.pool().is_disposed());
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(transport.pool().rent(), Err(ConnectionError::PoolDisposed)));
    transport.close().unwrap();
}

#[test]
fn mismatched_versions_never_reach_the_broker() {
    let broker = InMemoryBroker::new();
    let pipeline = Pipeline::new(
        BrokerTransport::new(
            broker.clone(),
            BrokerOptions::default().with_outbox(OutboxOptions::default().with_version("v2")),
        ),
        DispatcherConfig::default(),
    );

    assert!(matches!(
        pipeline.dispatcher.start(),
        Err(DispatchError::VersionMismatch { .. })
    ));
    pipeline
        .publisher
        .publish("orders.created", Message::new(1, json!({"id": 1})))
        .unwrap();
    pipeline.dispatcher.stop().unwrap();

    assert!(broker.deliveries().is_empty());
    assert_eq!(pipeline.status(1), Some(MessageStatus::Scheduled));
}

#[test]
fn broker_outage_leaves_rows_scheduled() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);
    let pipeline = Pipeline::new(
        BrokerTransport::new(broker.clone(), BrokerOptions::default()),
        DispatcherConfig::default(),
    );
    pipeline.dispatcher.start().unwrap();

    pipeline
        .publisher
        .publish("orders.created", Message::new(1, json!({"id": 1})))
        .unwrap();
    pipeline.dispatcher.stop().unwrap();

    assert!(broker.deliveries().is_empty());
    assert_eq!(pipeline.status(1), Some(MessageStatus::Scheduled));
    assert_eq!(pipeline.dispatcher.stats().failed, 1);
}
