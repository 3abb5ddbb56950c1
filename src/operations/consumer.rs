// src/operations/consumer.rs
// Consumer loop shared by subscribers, responders and the reply queue.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{BusCore, HandlerError};
use crate::broker::{BrokerChannel, DeliveryStream, Settlement};
use crate::channel_manager::ChannelLease;
use crate::error_handling::{ErrorHandlingStrategy, FailureKind, ProcessingFailure};
use crate::errors::{BusError, Result};
use crate::message::{BusMessage, InboundDelivery};
use crate::topology::Topology;

pub(crate) type DeliveryHandler =
    Arc<dyn Fn(Arc<dyn BrokerChannel>, InboundDelivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called each time the consumer loses its channel.
pub(crate) type DetachHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct ConsumerPlan {
    pub topology: Topology,
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
}

/// Declare the topology, attach the consumer, then keep it attached across
/// connection recoveries. Errors of the first attach are returned.
pub(crate) async fn start(
    core: Arc<BusCore>,
    plan: ConsumerPlan,
    handler: DeliveryHandler,
    on_detach: Option<DetachHook>,
) -> Result<JoinHandle<()>> {
    let (lease, deliveries) = attach(&core, &plan).await?;
    let span = info_span!(parent: &core.span, "consumer", queue = %plan.queue, tag = %plan.consumer_tag);

    let task = tokio::spawn(run(core.clone(), plan, handler, on_detach, lease, deliveries).instrument(span));
    core.track_consumer(task.abort_handle());
    Ok(task)
}

async fn attach(core: &BusCore, plan: &ConsumerPlan) -> Result<(ChannelLease, DeliveryStream)> {
    let mut lease = core.channels.acquire().await?;
    lease.mark_dedicated();
    core.channels.topology().declare(&*lease, &plan.topology).await?;
    let deliveries = lease.consume(&plan.queue, &plan.consumer_tag, plan.prefetch).await?;
    Ok((lease, deliveries))
}

async fn run(
    core: Arc<BusCore>,
    plan: ConsumerPlan,
    handler: DeliveryHandler,
    on_detach: Option<DetachHook>,
    mut lease: ChannelLease,
    mut deliveries: DeliveryStream,
) {
    loop {
        let channel = lease.channel();
        while let Some(item) = deliveries.next().await {
            match item {
                Ok(delivery) => {
                    tokio::spawn(handler(channel.clone(), delivery).in_current_span());
                }
                Err(e) => {
                    warn!(error = %e, "Delivery stream failed");
                    break;
                }
            }
        }
        drop(deliveries);
        drop(lease);

        if let Some(hook) = &on_detach {
            hook();
        }
        if core.channels.is_closed() {
            debug!("Consumer stopped with the bus");
            return;
        }
        info!("Consumer detached, re-attaching");

        (lease, deliveries) = loop {
            match attach(&core, &plan).await {
                Ok(attached) => break attached,
                Err(BusError::Shutdown) => return,
                Err(e) if e.is_recoverable() && core.config.automatic_recovery => {
                    warn!(error = %e, "Consumer re-attach failed, retrying");
                    sleep(core.config.recovery_interval()).await;
                }
                Err(e) => {
                    error!(error = %e, "Consumer could not re-attach, giving up");
                    return;
                }
            }
        };
        info!("Consumer re-attached");
    }
}

/// Decode a delivery through the type registry into `T`.
pub(crate) fn decode<T: BusMessage>(core: &BusCore, delivery: &InboundDelivery) -> Option<T> {
    let decoded = core.serializer.deserialize(&delivery.payload, &delivery.properties)?;
    match decoded.downcast::<T>() {
        Ok(message) => Some(message),
        Err(other) => {
            debug!(
                expected = T::message_type(),
                actual = %other.message_type,
                "Delivery holds a different message type"
            );
            None
        }
    }
}

/// Run a handler future, turning errors and panics into failures.
pub(crate) async fn invoke<R, Fut>(handler: Fut) -> std::result::Result<R, FailureKind>
where
    Fut: Future<Output = std::result::Result<R, HandlerError>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FailureKind::HandlerFailed(e.to_string())),
        Err(panic) => Err(FailureKind::HandlerPanicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) async fn settle(channel: &dyn BrokerChannel, delivery_tag: u64, settlement: Settlement) {
    if let Err(e) = channel.settle(delivery_tag, settlement).await {
        // The broker redelivers unsettled messages once the channel is gone.
        warn!(delivery_tag, ?settlement, error = %e, "Failed to settle delivery");
    }
}

/// Ack a delivery its handler processed and tell the strategy.
pub(crate) async fn complete(
    strategy: &dyn ErrorHandlingStrategy,
    channel: &dyn BrokerChannel,
    delivery: &InboundDelivery,
) {
    strategy.processed(delivery);
    settle(channel, delivery.delivery_tag, Settlement::Ack).await;
}

/// Let the strategy decide the fate of a failed delivery and settle it.
pub(crate) async fn handle_failure(
    strategy: &dyn ErrorHandlingStrategy,
    channel: &dyn BrokerChannel,
    failure: ProcessingFailure,
) {
    let disposition = strategy.classify(&failure).await;
    debug!(
        queue = %failure.queue,
        delivery_tag = failure.delivery.delivery_tag,
        reason = %failure.kind,
        ?disposition,
        "Processing failure classified"
    );
    settle(channel, failure.delivery.delivery_tag, disposition.into()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invoke_maps_errors_and_panics() {
        let ok = invoke(async { Ok::<_, HandlerError>(7) }).await;
        assert_eq!(ok, Ok(7));

        let failed = invoke(async { Err::<(), HandlerError>("bad input".into()) }).await;
        assert_eq!(failed, Err(FailureKind::HandlerFailed("bad input".to_string())));

        let panicked = invoke(async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), HandlerError>(())
        })
        .await;
        assert_eq!(panicked, Err(FailureKind::HandlerPanicked("kaboom".to_string())));
    }
}
