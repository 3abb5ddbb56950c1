// src/operations/subscriber.rs

use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::consumer::{self, ConsumerPlan, DeliveryHandler};
use super::{BusCore, HandlerError};
use crate::context::MessageContext;
use crate::error_handling::{ErrorHandlingStrategy, FailureKind, ProcessingFailure};
use crate::errors::Result;
use crate::message::BusMessage;
use crate::topology::{ExchangeDeclaration, QueueDeclaration, Topology};

/// Where and how to consume. Unset names follow the naming conventions.
#[derive(Clone, Default)]
pub struct SubscriptionConfig {
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    /// Subscribers with the same id share one queue and compete for messages.
    pub subscriber_id: Option<String>,
    pub prefetch: Option<u16>,
    pub error_strategy: Option<Arc<dyn ErrorHandlingStrategy>>,
}

impl SubscriptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn subscriber_id(mut self, id: impl Into<String>) -> Self {
        self.subscriber_id = Some(id.into());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn error_strategy(mut self, strategy: Arc<dyn ErrorHandlingStrategy>) -> Self {
        self.error_strategy = Some(strategy);
        self
    }
}

/// A running consumer. Dropping the handle leaves the consumer running;
/// `cancel` stops it and releases its channel.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn new(queue: String, consumer_tag: String, task: JoinHandle<()>) -> Self {
        Self {
            queue,
            consumer_tag,
            task,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn cancel(self) {
        self.task.abort();
        let _ = self.task.await;
        info!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Subscription cancelled");
    }
}

#[derive(Clone)]
pub struct Subscriber {
    core: Arc<BusCore>,
}

impl Subscriber {
    pub(crate) fn new(core: Arc<BusCore>) -> Self {
        Self { core }
    }

    /// Consume messages of type `T`, calling `handler` for each.
    ///
    /// Deliveries that do not decode into `T`, handler errors and handler
    /// panics go to the error strategy. A handler returning `Ok` acks.
    pub async fn subscribe<T, F, Fut>(&self, config: SubscriptionConfig, handler: F) -> Result<SubscriptionHandle>
    where
        T: BusMessage,
        F: Fn(T, Arc<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let core = self.core.clone();
        core.serializer.registry().register::<T>();

        let naming = &core.naming;
        let exchange = config
            .exchange
            .unwrap_or_else(|| naming.exchange_for(T::message_type()));
        let queue = config
            .queue
            .unwrap_or_else(|| naming.queue_for(T::message_type(), config.subscriber_id.as_deref()));
        let routing_key = config.routing_key.unwrap_or_else(|| T::routing_key().to_string());
        let strategy = config.error_strategy.unwrap_or_else(|| core.error_strategy.clone());

        let plan = ConsumerPlan {
            topology: Topology::subscription(
                ExchangeDeclaration::new(&exchange, naming.exchange_type),
                QueueDeclaration::new(&queue),
                routing_key,
            ),
            queue: queue.clone(),
            consumer_tag: naming.consumer_tag(),
            prefetch: config.prefetch.unwrap_or(core.config.prefetch_count),
        };
        let consumer_tag = plan.consumer_tag.clone();

        let handler = Arc::new(handler);
        let dispatch_core = core.clone();
        let dispatch: DeliveryHandler = Arc::new(move |channel, delivery| {
            let core = dispatch_core.clone();
            let handler = handler.clone();
            let strategy = strategy.clone();
            let queue = queue.clone();
            async move {
                let Some(message) = consumer::decode::<T>(&core, &delivery) else {
                    let failure = ProcessingFailure::new(FailureKind::UndecodableMessage, queue, delivery);
                    consumer::handle_failure(strategy.as_ref(), channel.as_ref(), failure).await;
                    return;
                };

                let context = Arc::new(core.contexts.extract(&delivery.properties));
                trace!(message_id = %context.message_id, "Dispatching message");
                match consumer::invoke(handler(message, context)).await {
                    Ok(()) => consumer::complete(strategy.as_ref(), channel.as_ref(), &delivery).await,
                    Err(kind) => {
                        let failure = ProcessingFailure::new(kind, queue, delivery);
                        consumer::handle_failure(strategy.as_ref(), channel.as_ref(), failure).await;
                    }
                }
            }
            .boxed()
        });

        let queue = plan.queue.clone();
        let task = consumer::start(core, plan, dispatch, None).await?;
        debug!(queue = %queue, consumer_tag = %consumer_tag, message_type = T::message_type(), "Subscribed");
        Ok(SubscriptionHandle::new(queue, consumer_tag, task))
    }
}
