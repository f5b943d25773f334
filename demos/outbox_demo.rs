//! Orders service publishing `orders.created` through the outbox.
//!
//! Run with `RUST_LOG=debug cargo run --example outbox_demo`.

use std::error::Error;
use std::sync::Arc;

use serde::Serialize;
use sourced_outbox::{
    BrokerOptions, BrokerTransport, Dispatch, Dispatcher, DispatcherConfig, ExchangeKind, InMemoryBroker,
    InMemoryStorage, MessageStatus, OutboxPublisher, PublisherConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct OrderCreated {
    id: u64,
    name: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = InMemoryBroker::new();
    let options = BrokerOptions::new("localhost", 5672)
        .with_credentials("guest", "guest")
        .with_exchange("shop.router", ExchangeKind::Topic);
    let transport = BrokerTransport::new(broker.clone(), options);

    let storage = InMemoryStorage::new();
    let dispatcher = Arc::new(Dispatcher::new(
        transport,
        Arc::new(storage.clone()),
        DispatcherConfig::default(),
    ));
    let publisher = OutboxPublisher::new(
        Arc::new(storage.clone()),
        dispatcher.clone(),
        PublisherConfig::default(),
    );
    dispatcher.start()?;

    for n in 1..=3u64 {
        let id = 1_000 + n as i64;
        let order = OrderCreated {
            id: n,
            name: format!("order-{n}"),
        };

        // The order row and its envelope commit together.
        let tx = storage.begin_in_memory_transaction(id)?;
        tx.stage("orders", &n.to_string(), serde_json::to_value(&order)?)?;
        publisher.publish_payload("orders.created", id, &order)?;
    }

    dispatcher.stop()?;

    for delivery in broker.deliveries() {
        info!(
            exchange = %delivery.exchange,
            route = %delivery.routing_key,
            message_id = %delivery.publishing.message_id,
            body = %String::from_utf8_lossy(&delivery.publishing.body),
            "Delivered"
        );
    }
    let succeeded = storage.published_with_status(MessageStatus::Succeeded).len();
    info!(succeeded, stats = ?dispatcher.stats(), "Done");
    Ok(())
}
