use rabbit_bus::broker::memory::ConfirmMode;
use rabbit_bus::{BusConfig, BusError, MemoryBroker, PublishOptions, PublishOutcome, TicketKey};
use std::time::Duration;
use tokio::time::Instant;

use crate::common::{connect, connect_with, order, test_config};

#[tokio::test(start_paused = true)]
async fn test_confirmed_publish_is_acked() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Delayed(Duration::from_millis(50)));
    let bus = connect(&broker).await;

    let started = Instant::now();
    let outcome = bus
        .publish(&order(1), PublishOptions::new().confirmed())
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::Acked);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed <= Duration::from_secs(2));
    assert_eq!(bus.channels().acknowledger().pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_publish_times_out() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Silent);
    let bus = connect(&broker).await;

    let started = Instant::now();
    let outcome = bus
        .publish(
            &order(2),
            PublishOptions::new().confirm_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert_eq!(outcome, PublishOutcome::TimedOut(Duration::from_millis(100)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(
        outcome.into_result(),
        Err(BusError::AcknowledgementTimeout(after)) if after == Duration::from_millis(100)
    ));
    assert_eq!(bus.channels().acknowledger().pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_confirm_timeout_defaults_to_config() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Silent);
    let bus = connect_with(
        &broker,
        BusConfig {
            publish_confirm_timeout_ms: 300,
            ..test_config()
        },
    )
    .await;

    let outcome = bus
        .publish(&order(3), PublishOptions::new().confirmed())
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::TimedOut(Duration::from_millis(300)));
}

#[tokio::test]
async fn test_nacked_publish_reports_its_ticket() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Nack);
    let bus = connect(&broker).await;

    let outcome = bus
        .publish(&order(4), PublishOptions::new().confirmed())
        .await
        .unwrap();

    let PublishOutcome::Nacked(key) = outcome else {
        panic!("expected a nack, got {:?}", outcome);
    };
    assert_eq!(key.sequence, 1);
    assert!(matches!(
        outcome.into_result(),
        Err(BusError::NegativeAcknowledgement(k)) if k == key
    ));
}

#[tokio::test]
async fn test_sequence_numbers_advance_per_channel() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::Nack);
    let bus = connect(&broker).await;

    let mut keys: Vec<TicketKey> = Vec::new();
    for id in 0..3 {
        match bus.publish(&order(id), PublishOptions::new().confirmed()).await.unwrap() {
            PublishOutcome::Nacked(key) => keys.push(key),
            other => panic!("expected a nack, got {:?}", other),
        }
    }

    // Sequential publishes reuse the pooled channel.
    assert!(keys.iter().all(|key| key.channel == keys[0].channel));
    let sequences: Vec<u64> = keys.iter().map(|key| key.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_confirm_requires_confirm_mode() {
    let broker = MemoryBroker::new();
    let bus = connect_with(
        &broker,
        BusConfig {
            publisher_confirms: false,
            ..test_config()
        },
    )
    .await;

    let err = bus
        .publish(&order(5), PublishOptions::new().confirmed())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Configuration(_)));

    let outcome = bus.publish(&order(5), PublishOptions::new()).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Unconfirmed);
}
