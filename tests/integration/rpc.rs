use rabbit_bus::broker::Settlement;
use rabbit_bus::{BusError, HandlerError, MemoryBroker, MessageContext, PublishOptions, RequestOptions, ResponderConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::common::{connect, eventually, PriceQuery, PriceQuote};

fn query(sku: &str) -> PriceQuery {
    PriceQuery { sku: sku.to_string() }
}

#[tokio::test]
async fn test_request_gets_the_response() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    bus.respond(ResponderConfig::new(), |query: PriceQuery, _| async move {
        Ok(PriceQuote {
            cents: query.sku.len() as u64 * 100,
            sku: query.sku,
        })
    })
    .await
    .unwrap();
    assert!(broker.has_binding("default_request_exchange", "pricing.query.requests", "pricing.query"));

    let quote: PriceQuote = bus.request(&query("abc"), RequestOptions::new()).await.unwrap();
    assert_eq!(
        quote,
        PriceQuote {
            sku: "abc".to_string(),
            cents: 300
        }
    );

    eventually("request acked", || {
        broker
            .settlements()
            .iter()
            .any(|record| record.queue == "pricing.query.requests" && record.settlement == Settlement::Ack)
    })
    .await;
}

#[tokio::test]
async fn test_stray_reply_is_dropped() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    // Answers every request twice: first with a reply for a request nobody
    // made, then for real.
    let stray_sender = bus.publisher();
    bus.respond(
        ResponderConfig::new(),
        move |query: PriceQuery, context: Arc<MessageContext>| {
            let publisher = stray_sender.clone();
            async move {
                let reply_to = context.reply_to.clone().unwrap_or_default();
                let stray = PriceQuote {
                    sku: "stray".to_string(),
                    cents: 0,
                };
                publisher
                    .publish(
                        &stray,
                        PublishOptions::new()
                            .exchange("")
                            .routing_key(reply_to)
                            .context(MessageContext::new().with_correlation_id("xyz")),
                    )
                    .await?;
                Ok::<_, HandlerError>(PriceQuote {
                    sku: query.sku,
                    cents: 1_250,
                })
            }
        },
    )
    .await
    .unwrap();

    let quote: PriceQuote = bus
        .request(&query("widget"), RequestOptions::new().correlation_id("abc"))
        .await
        .unwrap();
    assert_eq!(quote.sku, "widget");
    assert_eq!(quote.cents, 1_250);

    // Both replies were consumed and acked from the reply queue.
    eventually("both replies acked", || {
        broker
            .settlements()
            .iter()
            .filter(|record| record.queue.starts_with("rpc.response.") && record.settlement == Settlement::Ack)
            .count()
            == 2
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    bus.respond(ResponderConfig::new(), |query: PriceQuery, _| async move {
        // Later requests answer first.
        let delay = match query.sku.as_str() {
            "a" => 30,
            "b" => 20,
            _ => 10,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(PriceQuote {
            sku: query.sku,
            cents: delay,
        })
    })
    .await
    .unwrap();

    let (qa, qb, qc) = (query("a"), query("b"), query("c"));
    let (a, b, c) = tokio::join!(
        bus.request::<_, PriceQuote>(&qa, RequestOptions::new()),
        bus.request::<_, PriceQuote>(&qb, RequestOptions::new()),
        bus.request::<_, PriceQuote>(&qc, RequestOptions::new()),
    );
    assert_eq!(a.unwrap().sku, "a");
    assert_eq!(b.unwrap().sku, "b");
    assert_eq!(c.unwrap().sku, "c");
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    let started = Instant::now();
    let err = bus
        .request::<_, PriceQuote>(
            &query("nobody-listens"),
            RequestOptions::new()
                .correlation_id("lonely")
                .timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(200));
    match err {
        BusError::RequestTimeout { correlation_id, after } => {
            assert_eq!(correlation_id, "lonely");
            assert_eq!(after, Duration::from_millis(200));
        }
        other => panic!("expected a request timeout, got {:?}", other),
    }

    // The correlation id is free again once the request gave up.
    let again = bus
        .request::<_, PriceQuote>(
            &query("nobody-listens"),
            RequestOptions::new()
                .correlation_id("lonely")
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(again.is_timeout());
}

#[tokio::test]
async fn test_request_without_reply_to_is_rejected() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    bus.respond(ResponderConfig::new(), |query: PriceQuery, _| async move {
        Ok(PriceQuote {
            sku: query.sku,
            cents: 1,
        })
    })
    .await
    .unwrap();

    // A plain publish carries no reply destination.
    bus.publish(
        &query("orphan"),
        PublishOptions::new()
            .exchange("default_request_exchange")
            .routing_key("pricing.query"),
    )
    .await
    .unwrap();

    eventually("request rejected", || {
        broker.settlements().iter().any(|record| {
            record.queue == "pricing.query.requests" && record.settlement == Settlement::Reject { requeue: false }
        })
    })
    .await;
    assert_eq!(broker.queue_depth("pricing.query.requests"), 0);
}

#[tokio::test]
async fn test_failing_responder_leaves_requester_to_time_out() {
    let broker = MemoryBroker::new();
    let bus = connect(&broker).await;

    bus.respond(ResponderConfig::new(), |_: PriceQuery, _| async move {
        Err::<PriceQuote, HandlerError>("pricing backend unavailable".into())
    })
    .await
    .unwrap();

    let err = bus
        .request::<_, PriceQuote>(&query("x"), RequestOptions::new().timeout(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::RequestTimeout { .. }));
    assert!(broker.settlements().iter().any(|record| {
        record.queue == "pricing.query.requests" && record.settlement == Settlement::Reject { requeue: false }
    }));
}
