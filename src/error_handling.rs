// src/error_handling.rs
// Policies deciding what happens to a delivery that could not be processed.

use async_trait::async_trait;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

use crate::broker::Settlement;
use crate::channel_manager::ChannelManager;
use crate::message::{InboundDelivery, OutboundMessage, FAILURE_REASON_HEADER};
use crate::topology::{ExchangeDeclaration, ExchangeType};

/// Why processing a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// No type identity could be resolved or the payload did not decode.
    UndecodableMessage,
    /// A request arrived without a reply destination or correlation id.
    MissingReplyTo,
    HandlerFailed(String),
    HandlerPanicked(String),
}

impl FailureKind {
    /// Whether trying the same delivery again could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::HandlerFailed(_) | FailureKind::HandlerPanicked(_))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::UndecodableMessage => write!(f, "undecodable message"),
            FailureKind::MissingReplyTo => write!(f, "request without reply destination"),
            FailureKind::HandlerFailed(reason) => write!(f, "handler failed: {}", reason),
            FailureKind::HandlerPanicked(reason) => write!(f, "handler panicked: {}", reason),
        }
    }
}

/// What to do with the failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject,
    Requeue,
}

impl From<Disposition> for Settlement {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Ack => Settlement::Ack,
            Disposition::Reject => Settlement::Reject { requeue: false },
            Disposition::Requeue => Settlement::Nack { requeue: true },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingFailure {
    pub kind: FailureKind,
    pub queue: String,
    pub delivery: InboundDelivery,
}

impl ProcessingFailure {
    pub fn new(kind: FailureKind, queue: impl Into<String>, delivery: InboundDelivery) -> Self {
        Self {
            kind,
            queue: queue.into(),
            delivery,
        }
    }
}

#[async_trait]
pub trait ErrorHandlingStrategy: Send + Sync {
    async fn classify(&self, failure: &ProcessingFailure) -> Disposition;

    /// Called once a delivery was handled and acked.
    fn processed(&self, _delivery: &InboundDelivery) {}
}

/// Rejects without requeue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

#[async_trait]
impl ErrorHandlingStrategy for DefaultStrategy {
    async fn classify(&self, failure: &ProcessingFailure) -> Disposition {
        warn!(
            queue = %failure.queue,
            delivery_tag = failure.delivery.delivery_tag,
            reason = %failure.kind,
            "Rejecting delivery"
        );
        Disposition::Reject
    }
}

/// Message ids tracked at once before the least recently failed is dropped.
pub const DEFAULT_TRACKED_MESSAGES: usize = 10_000;

/// Requeues transient failures up to `max_requeues` times per message id,
/// then rejects. Permanent failures are rejected right away.
///
/// Counts live in an LRU table of at most `tracked` ids. An id leaves the
/// table when its message is finally processed or rejected.
pub struct LimitedRequeueStrategy {
    max_requeues: u32,
    attempts: Mutex<LruCache<String, u32>>,
}

impl LimitedRequeueStrategy {
    pub fn new(max_requeues: u32) -> Self {
        Self::with_capacity(max_requeues, DEFAULT_TRACKED_MESSAGES)
    }

    pub fn with_capacity(max_requeues: u32, tracked: usize) -> Self {
        let cap = NonZeroUsize::new(tracked).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_requeues,
            attempts: Mutex::new(LruCache::new(cap)),
        }
    }

    fn table(&self) -> MutexGuard<'_, LruCache<String, u32>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attempts(&self, message_id: &str) -> u32 {
        self.table().peek(message_id).copied().unwrap_or(0)
    }

    /// Number of message ids currently tracked.
    pub fn tracked(&self) -> usize {
        self.table().len()
    }
}

#[async_trait]
impl ErrorHandlingStrategy for LimitedRequeueStrategy {
    async fn classify(&self, failure: &ProcessingFailure) -> Disposition {
        let Some(message_id) = failure.delivery.properties.message_id.as_deref() else {
            return Disposition::Reject;
        };
        if !failure.kind.is_transient() {
            self.table().pop(message_id);
            return Disposition::Reject;
        }

        let mut attempts = self.table();
        let count = attempts.get(message_id).copied().unwrap_or(0);
        if count < self.max_requeues {
            attempts.put(message_id.to_string(), count + 1);
            info!(message_id, attempt = count + 1, max = self.max_requeues, reason = %failure.kind, "Requeueing delivery");
            Disposition::Requeue
        } else {
            attempts.pop(message_id);
            warn!(message_id, reason = %failure.kind, "Requeue limit reached, rejecting delivery");
            Disposition::Reject
        }
    }

    fn processed(&self, delivery: &InboundDelivery) {
        if let Some(message_id) = delivery.properties.message_id.as_deref() {
            self.table().pop(message_id);
        }
    }
}

/// Republishes the failed delivery to an error exchange with the failure
/// reason in the `x-failure-reason` header, then acks the original.
pub struct DeadLetterStrategy {
    channels: Arc<ChannelManager>,
    exchange: ExchangeDeclaration,
}

impl DeadLetterStrategy {
    pub fn new(channels: Arc<ChannelManager>, exchange: impl Into<String>) -> Self {
        Self {
            channels,
            exchange: ExchangeDeclaration::new(exchange, ExchangeType::Topic),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange.name
    }

    async fn republish(&self, failure: &ProcessingFailure) -> crate::errors::Result<()> {
        let lease = self.channels.acquire().await?;
        self.channels
            .topology()
            .declare_exchange(&*lease, &self.exchange)
            .await?;

        let properties = failure
            .delivery
            .properties
            .clone()
            .with_header(FAILURE_REASON_HEADER, failure.kind.to_string());
        lease
            .publish(OutboundMessage {
                exchange: self.exchange.name.clone(),
                routing_key: failure.delivery.routing_key.clone(),
                payload: failure.delivery.payload.clone(),
                properties,
            })
            .await
    }
}

#[async_trait]
impl ErrorHandlingStrategy for DeadLetterStrategy {
    async fn classify(&self, failure: &ProcessingFailure) -> Disposition {
        match self.republish(failure).await {
            Ok(()) => {
                info!(
                    queue = %failure.queue,
                    exchange = %self.exchange.name,
                    reason = %failure.kind,
                    "Dead-lettered delivery"
                );
                Disposition::Ack
            }
            Err(e) if !failure.delivery.redelivered => {
                error!(error = %e, "Dead-lettering failed, requeueing delivery");
                Disposition::Requeue
            }
            Err(e) => {
                error!(error = %e, "Dead-lettering failed again, rejecting delivery");
                Disposition::Reject
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageProperties;

    fn delivery(message_id: Option<&str>) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: 1,
            exchange: "orders".to_string(),
            routing_key: "orders.created".to_string(),
            redelivered: false,
            payload: b"{}".to_vec(),
            properties: MessageProperties {
                message_id: message_id.map(str::to_string),
                ..MessageProperties::default()
            },
        }
    }

    #[tokio::test]
    async fn test_default_strategy_rejects_without_requeue() {
        let failure = ProcessingFailure::new(FailureKind::UndecodableMessage, "q", delivery(None));
        let disposition = DefaultStrategy.classify(&failure).await;
        assert_eq!(disposition, Disposition::Reject);
        assert_eq!(Settlement::from(disposition), Settlement::Reject { requeue: false });
    }

    #[tokio::test]
    async fn test_limited_requeue_gives_up() {
        let strategy = LimitedRequeueStrategy::new(2);
        let failure = ProcessingFailure::new(
            FailureKind::HandlerFailed("boom".to_string()),
            "q",
            delivery(Some("m-1")),
        );

        assert_eq!(strategy.classify(&failure).await, Disposition::Requeue);
        assert_eq!(strategy.classify(&failure).await, Disposition::Requeue);
        assert_eq!(strategy.attempts("m-1"), 2);
        assert_eq!(strategy.classify(&failure).await, Disposition::Reject);
        assert_eq!(strategy.attempts("m-1"), 0);
    }

    #[tokio::test]
    async fn test_limited_requeue_rejects_permanent_failures() {
        let strategy = LimitedRequeueStrategy::new(5);
        let failure = ProcessingFailure::new(FailureKind::UndecodableMessage, "q", delivery(Some("m-2")));
        assert_eq!(strategy.classify(&failure).await, Disposition::Reject);
        assert_eq!(strategy.tracked(), 0);
    }

    #[tokio::test]
    async fn test_limited_requeue_forgets_processed_messages() {
        let strategy = LimitedRequeueStrategy::new(3);
        for n in 0..1000 {
            let id = format!("m-{}", n);
            let failure = ProcessingFailure::new(
                FailureKind::HandlerFailed("flaky".to_string()),
                "q",
                delivery(Some(&id)),
            );
            assert_eq!(strategy.classify(&failure).await, Disposition::Requeue);
            strategy.processed(&failure.delivery);
        }
        assert_eq!(strategy.tracked(), 0);
    }

    #[tokio::test]
    async fn test_limited_requeue_table_is_bounded() {
        let strategy = LimitedRequeueStrategy::with_capacity(3, 2);
        let failing = |id: &str| {
            ProcessingFailure::new(FailureKind::HandlerFailed("down".to_string()), "q", delivery(Some(id)))
        };

        strategy.classify(&failing("a")).await;
        strategy.classify(&failing("b")).await;
        strategy.classify(&failing("a")).await;
        // Never settled elsewhere; "b" is the least recently failed and goes.
        strategy.classify(&failing("c")).await;

        assert_eq!(strategy.tracked(), 2);
        assert_eq!(strategy.attempts("a"), 2);
        assert_eq!(strategy.attempts("b"), 0);
        assert_eq!(strategy.attempts("c"), 1);
    }

    #[cfg(feature = "memory-broker")]
    #[tokio::test]
    async fn test_dead_letter_republishes_with_reason() {
        use crate::acknowledger::PublishAcknowledger;
        use crate::broker::{BrokerConnection, BrokerConnector, MemoryBroker};
        use crate::config::BusConfig;
        use crate::topology::{BindingDeclaration, QueueDeclaration, TopologyProvider};
        use tracing::Span;

        let broker = MemoryBroker::new();
        let config = Arc::new(BusConfig::default());
        let channels = Arc::new(ChannelManager::new(
            config.clone(),
            Arc::new(broker.clone()),
            Arc::new(TopologyProvider::new()),
            Arc::new(PublishAcknowledger::new(config.publish_confirm_timeout())),
            Span::none(),
        ));

        let strategy = DeadLetterStrategy::new(channels, "errors");
        let failure = ProcessingFailure::new(FailureKind::HandlerFailed("boom".to_string()), "q", delivery(None));
        assert_eq!(strategy.classify(&failure).await, Disposition::Ack);

        let setup = broker.connect().await.unwrap().create_channel().await.unwrap();
        setup.declare_queue(&QueueDeclaration::new("errors.all")).await.unwrap();
        setup
            .bind_queue(&BindingDeclaration::new("errors", "errors.all", "#"))
            .await
            .unwrap();
        assert_eq!(strategy.classify(&failure).await, Disposition::Ack);

        let published = broker.published();
        let last = published.last().unwrap();
        assert_eq!(last.exchange, "errors");
        assert_eq!(last.properties.header_str(FAILURE_REASON_HEADER), Some("handler failed: boom"));
        assert_eq!(broker.queue_depth("errors.all"), 1);
    }
}
