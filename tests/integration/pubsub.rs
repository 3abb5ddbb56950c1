use rabbit_bus::broker::Settlement;
use rabbit_bus::{MemoryBroker, MessageContext, PublishOptions, PublishOutcome, SubscriptionConfig};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::common::{connect, eventually, order, recv, OrderPlaced};

#[tokio::test]
async fn test_published_message_reaches_subscriber_and_is_acked() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = bus
        .subscribe(SubscriptionConfig::new(), move |message: OrderPlaced, context: Arc<MessageContext>| {
            let tx = tx.clone();
            async move {
                tx.send((message, context)).ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(handle.queue(), "orders.placed");
    assert!(broker.has_exchange("orders"));
    assert!(broker.has_binding("orders", "orders.placed", "orders.placed"));

    let outcome = bus.publish(&order(7), PublishOptions::new()).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Unconfirmed);

    let (message, context) = recv(&mut rx).await;
    assert_eq!(message, order(7));
    assert_eq!(context.originating_app(), Some("integration"));
    assert!(context.timestamp().is_some());

    eventually("delivery acked", || {
        broker
            .settlements()
            .iter()
            .any(|record| record.queue == "orders.placed" && record.settlement == Settlement::Ack)
    })
    .await;
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_context_properties_travel_with_the_message() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(SubscriptionConfig::new(), move |_: OrderPlaced, context: Arc<MessageContext>| {
        let tx = tx.clone();
        async move {
            tx.send(context).ok();
            Ok(())
        }
    })
    .await
    .unwrap();

    let sent = bus.new_context().with_property("tenant", "acme");
    bus.publish(&order(1), PublishOptions::new().context(sent.clone()))
        .await
        .unwrap();

    let received = recv(&mut rx).await;
    assert_eq!(received.message_id, sent.message_id);
    assert_eq!(received.property("tenant"), Some(&json!("acme")));
}

#[tokio::test]
async fn test_subscribers_sharing_an_id_compete_for_messages() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for worker in ["a", "b"] {
        let tx = tx.clone();
        bus.subscribe(
            SubscriptionConfig::new().subscriber_id("billing").prefetch(1),
            move |message: OrderPlaced, _| {
                let tx = tx.clone();
                async move {
                    tx.send((worker, message.order_id)).ok();
                    Ok(())
                }
            },
        )
        .await
        .unwrap();
    }
    assert_eq!(broker.consumer_count("orders.placed_billing"), 2);

    for id in 0..4 {
        bus.publish(&order(id), PublishOptions::new()).await.unwrap();
    }

    let mut ids = Vec::new();
    let mut workers = Vec::new();
    for _ in 0..4 {
        let (worker, id) = recv(&mut rx).await;
        workers.push(worker);
        ids.push(id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert!(workers.contains(&"a") && workers.contains(&"b"));
}

#[tokio::test]
async fn test_distinct_subscribers_each_get_a_copy() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in ["audit", "shipping"] {
        let tx = tx.clone();
        bus.subscribe(SubscriptionConfig::new().subscriber_id(id), move |_: OrderPlaced, _| {
            let tx = tx.clone();
            async move {
                tx.send(id).ok();
                Ok(())
            }
        })
        .await
        .unwrap();
    }

    bus.publish(&order(3), PublishOptions::new()).await.unwrap();

    let mut seen = vec![recv(&mut rx).await, recv(&mut rx).await];
    seen.sort_unstable();
    assert_eq!(seen, vec!["audit", "shipping"]);
}

#[tokio::test]
async fn test_cancelled_subscription_stops_consuming() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let handle = bus
        .subscribe(SubscriptionConfig::new(), |_: OrderPlaced, _| async { Ok(()) })
        .await
        .unwrap();
    assert!(handle.is_active());
    assert_eq!(broker.consumer_count("orders.placed"), 1);

    handle.cancel().await;
    eventually("consumer removed", || broker.consumer_count("orders.placed") == 0).await;

    bus.publish(&order(9), PublishOptions::new()).await.unwrap();
    assert_eq!(broker.queue_depth("orders.placed"), 1);
}

#[tokio::test]
async fn test_explicit_routing_reaches_topic_binding() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        SubscriptionConfig::new()
            .exchange("sales")
            .queue("eu-orders")
            .routing_key("orders.eu.*"),
        move |message: OrderPlaced, _| {
            let tx = tx.clone();
            async move {
                tx.send(message.order_id).ok();
                Ok(())
            }
        },
    )
    .await
    .unwrap();

    let publish = |id, key: &'static str| {
        let bus = bus.clone();
        async move {
            bus.publish(&order(id), PublishOptions::new().exchange("sales").routing_key(key))
                .await
                .unwrap()
        }
    };
    publish(1, "orders.us.created").await;
    publish(2, "orders.eu.created").await;

    assert_eq!(recv(&mut rx).await, 2);
    assert_eq!(broker.queue_depth("eu-orders"), 0);
}
