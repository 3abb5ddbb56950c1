// src/operations/responder.rs

use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::consumer::{self, ConsumerPlan, DeliveryHandler};
use super::publisher::{outbound_properties, send};
use super::subscriber::SubscriptionHandle;
use super::{BusCore, HandlerError};
use crate::broker::Settlement;
use crate::context::MessageContext;
use crate::error_handling::{ErrorHandlingStrategy, FailureKind, ProcessingFailure};
use crate::errors::Result;
use crate::message::{BusMessage, InboundDelivery, OutboundMessage};
use crate::topology::{ExchangeDeclaration, QueueDeclaration, Topology};

/// Where requests are consumed. Unset names follow the naming conventions.
#[derive(Clone, Default)]
pub struct ResponderConfig {
    /// Defaults to the request exchange.
    pub exchange: Option<String>,
    /// Defaults to `<request type>.requests`.
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub prefetch: Option<u16>,
    pub error_strategy: Option<Arc<dyn ErrorHandlingStrategy>>,
}

impl ResponderConfig {
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

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn error_strategy(mut self, strategy: Arc<dyn ErrorHandlingStrategy>) -> Self {
        self.error_strategy = Some(strategy);
        self
    }
}

#[derive(Clone)]
pub struct Responder {
    core: Arc<BusCore>,
}

impl Responder {
    pub(crate) fn new(core: Arc<BusCore>) -> Self {
        Self { core }
    }

    /// Answer requests of type `Req` with the handler's `Resp`.
    ///
    /// The reply goes to the default exchange, routed to the requester's
    /// reply queue, and carries the request's correlation id. The request is
    /// acked once the reply is out.
    pub async fn respond<Req, Resp, F, Fut>(&self, config: ResponderConfig, handler: F) -> Result<SubscriptionHandle>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req, Arc<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        let core = self.core.clone();
        core.serializer.registry().register::<Req>();

        let naming = &core.naming;
        let exchange = config
            .exchange
            .unwrap_or_else(|| naming.request_exchange.clone());
        let queue = config
            .queue
            .unwrap_or_else(|| naming.request_queue_for(Req::message_type()));
        let routing_key = config.routing_key.unwrap_or_else(|| Req::routing_key().to_string());
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
                let fail = |kind: FailureKind, delivery: InboundDelivery| {
                    let failure = ProcessingFailure::new(kind, queue.clone(), delivery);
                    let strategy = strategy.clone();
                    let channel = channel.clone();
                    async move { consumer::handle_failure(strategy.as_ref(), channel.as_ref(), failure).await }
                };

                let (Some(reply_to), Some(correlation_id)) = (
                    delivery.properties.reply_to.clone(),
                    delivery.properties.correlation_id.clone(),
                ) else {
                    return fail(FailureKind::MissingReplyTo, delivery).await;
                };
                let Some(request) = consumer::decode::<Req>(&core, &delivery) else {
                    return fail(FailureKind::UndecodableMessage, delivery).await;
                };

                let context = Arc::new(core.contexts.extract(&delivery.properties));
                trace!(correlation_id = %correlation_id, "Handling request");
                let response = match consumer::invoke(handler(request, context)).await {
                    Ok(response) => response,
                    Err(kind) => return fail(kind, delivery).await,
                };

                match reply(&core, &response, reply_to, correlation_id).await {
                    Ok(()) => consumer::complete(strategy.as_ref(), channel.as_ref(), &delivery).await,
                    Err(e) => {
                        warn!(error = %e, "Failed to send reply, requeueing request");
                        let requeue = Settlement::Nack { requeue: true };
                        consumer::settle(channel.as_ref(), delivery.delivery_tag, requeue).await;
                    }
                }
            }
            .boxed()
        });

        let queue = plan.queue.clone();
        let task = consumer::start(core, plan, dispatch, None).await?;
        debug!(
            queue = %queue,
            request_type = Req::message_type(),
            response_type = Resp::message_type(),
            "Responding"
        );
        Ok(SubscriptionHandle::new(queue, consumer_tag, task))
    }
}

async fn reply<Resp: BusMessage>(
    core: &BusCore,
    response: &Resp,
    reply_to: String,
    correlation_id: String,
) -> Result<()> {
    let mut context = core.contexts.create();
    context.correlation_id = Some(correlation_id);
    let mut properties = outbound_properties(core, Resp::message_type());
    core.contexts.apply(&context, &mut properties)?;

    // Reply queues are private and vanish with their requester, so there is
    // nothing to declare and nothing worth confirming.
    send(
        core,
        None,
        OutboundMessage {
            exchange: String::new(),
            routing_key: reply_to,
            payload: core.serializer.serialize(Some(response))?,
            properties,
        },
        false,
        None,
    )
    .await?;
    Ok(())
}
