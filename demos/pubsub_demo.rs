// demos/pubsub_demo.rs
//
// Two competing workers and one auditor consuming order events, with
// confirmed publishes. Uses the in-memory broker unless
// RABBIT_BUS_DEMO_BROKER=amqp.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use rabbit_bus::{
    logging, BusClient, BusConfig, BusMessage, HandlerError, LimitedRequeueStrategy, MemoryBroker, PublishOptions, SubscriptionConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPlaced {
    order_id: u32,
    customer: String,
    total_cents: u64,
    #[serde(default)]
    coupon: Option<String>,
}

impl BusMessage for OrderPlaced {
    fn message_type() -> &'static str {
        "orders.placed"
    }
}

async fn connect() -> Result<BusClient> {
    let builder = BusClient::builder().register::<OrderPlaced>();
    let builder = match std::env::var("RABBIT_BUS_DEMO_BROKER").as_deref() {
        Ok("amqp") => builder.config(rabbit_bus::load_config()?),
        _ => builder
            .config(BusConfig {
                application_name: "pubsub_demo".to_string(),
                ..BusConfig::default()
            })
            .connector(Arc::new(MemoryBroker::new())),
    };
    Ok(builder.connect().await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let bus = connect().await?;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

    let requeue = Arc::new(LimitedRequeueStrategy::new(1));
    let mut handles = Vec::new();
    for worker in ["worker-1", "worker-2"] {
        let done = done_tx.clone();
        let handle = bus
            .subscribe(
                SubscriptionConfig::new()
                    .subscriber_id("fulfilment")
                    .prefetch(1)
                    .error_strategy(requeue.clone()),
                move |order: OrderPlaced, context| {
                    let done = done.clone();
                    async move {
                        if order.total_cents == 0 {
                            return Err(HandlerError::from("refusing an empty order"));
                        }
                        info!(worker, order_id = order.order_id, from = ?context.originating_app(), "Fulfilling order");
                        done.send(format!("{} fulfilled order {}", worker, order.order_id)).ok();
                        Ok(())
                    }
                },
            )
            .await?;
        handles.push(handle);
    }

    let audit = done_tx.clone();
    handles.push(
        bus.subscribe(
            SubscriptionConfig::new().subscriber_id("audit"),
            move |order: OrderPlaced, _| {
                let audit = audit.clone();
                async move {
                    audit.send(format!("audit saw order {} from {}", order.order_id, order.customer)).ok();
                    Ok(())
                }
            },
        )
        .await?,
    );

    for order_id in 1..=4 {
        let order = OrderPlaced {
            order_id,
            customer: format!("customer-{}", order_id),
            total_cents: if order_id == 4 { 0 } else { 1_000 * order_id as u64 },
            coupon: None,
        };
        let outcome = bus.publish(&order, PublishOptions::new().confirmed()).await?;
        if let Err(e) = outcome.into_result() {
            warn!(order_id, error = %e, "Publish not confirmed");
        }
    }

    // Three fulfilments and four audit entries; order 4 is refused.
    for _ in 0..7 {
        match tokio::time::timeout(Duration::from_secs(5), done_rx.recv()).await {
            Ok(Some(line)) => println!("{}", line),
            _ => break,
        }
    }

    for handle in handles {
        handle.cancel().await;
    }
    bus.shutdown().await?;
    Ok(())
}
