use rabbit_bus::broker::{BrokerChannel, Settlement};
use rabbit_bus::message::{MessageProperties, OutboundMessage, FAILURE_REASON_HEADER, MESSAGE_TYPE_HEADER};
use rabbit_bus::{
    BusClient, HandlerError, LimitedRequeueStrategy, MemoryBroker, PublishOptions, SubscriptionConfig,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::common::{connect, eventually, order, recv, test_config, OrderPlaced, PriceQuote};

fn settlements_on(broker: &MemoryBroker, queue: &str) -> Vec<Settlement> {
    broker
        .settlements()
        .into_iter()
        .filter(|record| record.queue == queue)
        .map(|record| record.settlement)
        .collect()
}

#[tokio::test]
async fn test_undecodable_delivery_is_rejected_without_requeue() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    bus.subscribe(SubscriptionConfig::new(), move |_: OrderPlaced, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    })
    .await
    .unwrap();

    // Not JSON at all, sent straight through a leased channel.
    let lease = bus.channels().acquire().await.unwrap();
    lease
        .publish(OutboundMessage {
            exchange: "orders".to_string(),
            routing_key: "orders.placed".to_string(),
            payload: b"\x00\x01 definitely not json".to_vec(),
            properties: MessageProperties::default().with_header(MESSAGE_TYPE_HEADER, "orders.placed"),
        })
        .await
        .unwrap();
    drop(lease);

    eventually("garbage rejected", || !settlements_on(&broker, "orders.placed").is_empty()).await;
    assert_eq!(
        settlements_on(&broker, "orders.placed"),
        vec![Settlement::Reject { requeue: false }]
    );
    assert_eq!(broker.queue_depth("orders.placed"), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delivery_of_another_type_is_undecodable() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(SubscriptionConfig::new(), move |message: OrderPlaced, _| {
        let tx = tx.clone();
        async move {
            tx.send(message.order_id).ok();
            Ok(())
        }
    })
    .await
    .unwrap();

    let quote = PriceQuote {
        sku: "misrouted".to_string(),
        cents: 1,
    };
    bus.publish(&quote, PublishOptions::new().exchange("orders").routing_key("orders.placed"))
        .await
        .unwrap();
    bus.publish(&order(11), PublishOptions::new()).await.unwrap();

    // The subscriber keeps going after the bad delivery.
    assert_eq!(recv(&mut rx).await, 11);
    eventually("both settled", || settlements_on(&broker, "orders.placed").len() == 2).await;
    let settlements = settlements_on(&broker, "orders.placed");
    assert!(settlements.contains(&Settlement::Reject { requeue: false }));
    assert!(settlements.contains(&Settlement::Ack));
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(SubscriptionConfig::new(), move |message: OrderPlaced, _| {
        let tx = tx.clone();
        async move {
            if message.order_id == 13 {
                panic!("unlucky order");
            }
            tx.send(message.order_id).ok();
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&order(13), PublishOptions::new()).await.unwrap();
    bus.publish(&order(14), PublishOptions::new()).await.unwrap();

    assert_eq!(recv(&mut rx).await, 14);
    eventually("panic rejected", || {
        settlements_on(&broker, "orders.placed").contains(&Settlement::Reject { requeue: false })
    })
    .await;
}

#[tokio::test]
async fn test_limited_requeue_gives_up_after_the_limit() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let strategy = Arc::new(LimitedRequeueStrategy::new(2));
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    bus.subscribe(
        SubscriptionConfig::new().error_strategy(strategy.clone()),
        move |_: OrderPlaced, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), HandlerError>("inventory service down".into()) }
        },
    )
    .await
    .unwrap();

    bus.publish(&order(21), PublishOptions::new()).await.unwrap();

    eventually("message rejected", || settlements_on(&broker, "orders.placed").len() == 3).await;
    assert_eq!(
        settlements_on(&broker, "orders.placed"),
        vec![
            Settlement::Nack { requeue: true },
            Settlement::Nack { requeue: true },
            Settlement::Reject { requeue: false },
        ]
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_depth("orders.placed"), 0);
}

#[tokio::test]
async fn test_limited_requeue_forgets_messages_that_succeed_on_redelivery() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let strategy = Arc::new(LimitedRequeueStrategy::new(3));
    let failed_once = Arc::new(Mutex::new(HashSet::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        SubscriptionConfig::new().error_strategy(strategy.clone()),
        move |message: OrderPlaced, _| {
            let tx = tx.clone();
            // Even orders fail on their first delivery only.
            let first_failure = message.order_id % 2 == 0 && failed_once.lock().unwrap().insert(message.order_id);
            async move {
                if first_failure {
                    return Err::<(), HandlerError>("warming up".into());
                }
                tx.send(message.order_id).ok();
                Ok(())
            }
        },
    )
    .await
    .unwrap();

    for id in 0..10 {
        bus.publish(&order(id), PublishOptions::new()).await.unwrap();
    }

    let mut delivered = Vec::new();
    while delivered.len() < 10 {
        delivered.push(recv(&mut rx).await);
    }
    delivered.sort();
    assert_eq!(delivered, (0..10).collect::<Vec<u32>>());

    eventually("all acked", || {
        settlements_on(&broker, "orders.placed")
            .iter()
            .filter(|settlement| **settlement == Settlement::Ack)
            .count()
            == 10
    })
    .await;
    assert_eq!(strategy.tracked(), 0);
}

#[tokio::test]
async fn test_dead_letter_strategy_republishes_with_reason() {
    let broker = MemoryBroker::new();
    let bus = BusClient::builder()
        .config(test_config())
        .connector(Arc::new(broker.clone()))
        .dead_letter_errors()
        .connect()
        .await
        .unwrap();

    bus.subscribe(SubscriptionConfig::new(), |_: OrderPlaced, _| async {
        Err::<(), HandlerError>("address missing".into())
    })
    .await
    .unwrap();

    bus.publish(&order(31), PublishOptions::new()).await.unwrap();

    eventually("original acked", || {
        settlements_on(&broker, "orders.placed") == vec![Settlement::Ack]
    })
    .await;
    assert!(broker.has_exchange("default_error_exchange"));

    let dead = broker
        .published()
        .into_iter()
        .find(|message| message.exchange == "default_error_exchange")
        .expect("nothing dead-lettered");
    assert_eq!(dead.routing_key, "orders.placed");
    assert_eq!(
        dead.properties.header_str(FAILURE_REASON_HEADER),
        Some("handler failed: address missing")
    );
    assert_eq!(dead.properties.message_type(), Some("orders.placed"));
}
