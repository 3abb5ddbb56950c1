use rabbit_bus::{BusConfig, BusError, MemoryBroker, PublishOptions, RequestOptions, SubscriptionConfig};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::{connect, connect_with, eventually, eventually_async, order, recv, test_config, OrderPlaced, PriceQuery, PriceQuote};

async fn subscribe_orders(bus: &rabbit_bus::BusClient) -> mpsc::UnboundedReceiver<u32> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(SubscriptionConfig::new(), move |message: OrderPlaced, _| {
        let tx = tx.clone();
        async move {
            tx.send(message.order_id).ok();
            Ok(())
        }
    })
    .await
    .unwrap();
    rx
}

#[tokio::test]
async fn test_subscriber_reattaches_after_connection_loss() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;
    let mut received = subscribe_orders(&bus).await;

    bus.publish(&order(1), PublishOptions::new()).await.unwrap();
    assert_eq!(recv(&mut received).await, 1);
    assert_eq!(bus.channels().generation(), 1);

    broker.disconnect();
    eventually("consumer re-attached", || broker.consumer_count("orders.placed") == 1).await;
    assert_eq!(bus.channels().generation(), 2);
    assert_eq!(broker.connection_count(), 2);

    bus.publish(&order(2), PublishOptions::new()).await.unwrap();
    assert_eq!(recv(&mut received).await, 2);
}

#[tokio::test]
async fn test_topology_is_replayed_after_broker_restart() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;
    let mut received = subscribe_orders(&bus).await;

    broker.disconnect();
    broker.reset_topology();
    assert!(!broker.has_queue("orders.placed"));

    eventually("topology replayed", || {
        broker.has_exchange("orders") && broker.has_binding("orders", "orders.placed", "orders.placed")
    })
    .await;
    eventually("consumer re-attached", || broker.consumer_count("orders.placed") == 1).await;

    bus.publish(&order(5), PublishOptions::new()).await.unwrap();
    assert_eq!(recv(&mut received).await, 5);
}

#[tokio::test]
async fn test_unacked_messages_are_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    bus.subscribe(SubscriptionConfig::new(), move |message: OrderPlaced, _| {
        let tx = tx.clone();
        let mut release = release_rx.clone();
        async move {
            tx.send(message.order_id).ok();
            // Hold the first delivery until the connection is gone.
            while !*release.borrow() {
                if release.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    bus.publish(&order(8), PublishOptions::new()).await.unwrap();
    assert_eq!(recv(&mut rx).await, 8);
    assert_eq!(broker.unacked_count(), 1);

    broker.disconnect();
    release_tx.send(true).ok();

    // Redelivered on the new connection.
    assert_eq!(recv(&mut rx).await, 8);
    eventually("redelivery acked", || broker.unacked_count() == 0 && broker.queue_depth("orders.placed") == 0)
        .await;
}

#[tokio::test]
async fn test_pending_request_fails_when_reply_consumer_is_lost() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let requester = bus.clone();
    let request = tokio::spawn(async move {
        requester
            .request::<_, PriceQuote>(
                &PriceQuery { sku: "slow".to_string() },
                RequestOptions::new().timeout(Duration::from_secs(30)),
            )
            .await
    });

    eventually("reply queue declared", || {
        broker.published().iter().any(|message| message.exchange == "default_request_exchange")
    })
    .await;
    broker.disconnect();

    let err = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("request did not fail in time")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, BusError::Connection(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_publish_without_automatic_recovery_surfaces_connection_error() {
    let broker = MemoryBroker::new();
    let bus = connect_with(
        &broker,
        BusConfig {
            automatic_recovery: false,
            ..test_config()
        },
    )
    .await;

    bus.publish(&order(1), PublishOptions::new()).await.unwrap();
    broker.disconnect();

    // The loss sticks: no later call reconnects behind the caller's back.
    for id in 2..5 {
        let err = bus.publish(&order(id), PublishOptions::new()).await.unwrap_err();
        assert!(matches!(err, BusError::Connection(_)), "publish {}: {:?}", id, err);
    }
    let err = bus.channels().acquire().await.unwrap_err();
    assert!(matches!(err, BusError::Connection(_)));
    assert_eq!(broker.connection_count(), 1);

    bus.channels().connect().await.unwrap();
    bus.publish(&order(5), PublishOptions::new()).await.unwrap();
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test]
async fn test_shutdown_stops_consumers_and_refuses_work() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;
    let _received = subscribe_orders(&bus).await;
    assert!(bus.channels().is_connected().await);

    bus.shutdown().await.unwrap();

    eventually_async("connection closed", || {
        let bus = bus.clone();
        async move { !bus.channels().is_connected().await }
    })
    .await;
    eventually("consumer gone", || broker.consumer_count("orders.placed") == 0).await;

    let err = bus.publish(&order(3), PublishOptions::new()).await.unwrap_err();
    assert!(matches!(err, BusError::Shutdown));
}
