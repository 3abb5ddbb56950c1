use rabbit_bus::{BusClient, BusConfig, BusMessage, MemoryBroker};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub order_id: u32,
    pub customer: String,
}

impl BusMessage for OrderPlaced {
    fn message_type() -> &'static str {
        "orders.placed"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuery {
    pub sku: String,
}

impl BusMessage for PriceQuery {
    fn message_type() -> &'static str {
        "pricing.query"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub sku: String,
    pub cents: u64,
}

impl BusMessage for PriceQuote {
    fn message_type() -> &'static str {
        "pricing.quote"
    }
}

pub fn order(order_id: u32) -> OrderPlaced {
    OrderPlaced {
        order_id,
        customer: "ada".to_string(),
    }
}

pub fn test_config() -> BusConfig {
    BusConfig {
        recovery_interval_ms: 50,
        request_timeout_ms: 2_000,
        application_name: "integration".to_string(),
        ..BusConfig::default()
    }
}

pub async fn connect(broker: &MemoryBroker) -> BusClient {
    connect_with(broker, test_config()).await
}

pub async fn connect_with(broker: &MemoryBroker, config: BusConfig) -> BusClient {
    BusClient::builder()
        .config(config)
        .connector(Arc::new(broker.clone()))
        .connect()
        .await
        .unwrap()
}

pub async fn recv<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("nothing received within 5s")
        .expect("sender dropped")
}

/// Poll `condition` until it holds or 5s have passed.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}

/// Same as `eventually` for conditions that need to await.
pub async fn eventually_async<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {}", what);
}
