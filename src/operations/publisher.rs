// src/operations/publisher.rs

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::BusCore;
use crate::acknowledger::{ConfirmOutcome, TicketKey};
use crate::context::MessageContext;
use crate::errors::{BusError, Result};
use crate::message::{BusMessage, MessageProperties, OutboundMessage, MESSAGE_TYPE_HEADER};
use crate::topology::ExchangeDeclaration;

/// Per-call publish settings. Unset exchange and routing key are derived from
/// the message type.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// Wait for the broker to confirm the publish.
    pub confirm: bool,
    /// Overrides the configured confirm timeout.
    pub confirm_timeout: Option<Duration>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub context: Option<MessageContext>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm = true;
        self.confirm_timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn context(mut self, context: MessageContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the channel, no confirm requested.
    Unconfirmed,
    Acked,
    Nacked(TicketKey),
    TimedOut(Duration),
}

impl PublishOutcome {
    /// Turn nacks and timeouts into their distinct errors.
    pub fn into_result(self) -> Result<Self> {
        match self {
            PublishOutcome::Nacked(key) => Err(BusError::NegativeAcknowledgement(key)),
            PublishOutcome::TimedOut(after) => Err(BusError::AcknowledgementTimeout(after)),
            outcome => Ok(outcome),
        }
    }

    pub fn is_acked(&self) -> bool {
        matches!(self, PublishOutcome::Acked)
    }
}

/// Publishes typed messages. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    core: Arc<BusCore>,
}

impl Publisher {
    pub(crate) fn new(core: Arc<BusCore>) -> Self {
        Self { core }
    }

    #[instrument(
        name = "publish",
        parent = &self.core.span,
        skip_all,
        fields(message_type = T::message_type(), confirm = options.confirm)
    )]
    pub async fn publish<T: BusMessage>(&self, message: &T, options: PublishOptions) -> Result<PublishOutcome> {
        let core = &self.core;
        let exchange = options
            .exchange
            .unwrap_or_else(|| core.naming.exchange_for(T::message_type()));
        let routing_key = options.routing_key.unwrap_or_else(|| T::routing_key().to_string());

        let payload = core.serializer.serialize(Some(message))?;
        let context = core.contexts.stamp(options.context.unwrap_or_default());
        let mut properties = outbound_properties(core, T::message_type());
        properties.headers.extend(options.headers);
        core.contexts.apply(&context, &mut properties)?;

        let declaration = ExchangeDeclaration::new(&exchange, core.naming.exchange_type);
        send(
            core,
            Some(&declaration),
            OutboundMessage {
                exchange,
                routing_key,
                payload,
                properties,
            },
            options.confirm,
            options.confirm_timeout,
        )
        .await
    }
}

/// Properties every message of this bus carries.
pub(crate) fn outbound_properties(core: &BusCore, message_type: &str) -> MessageProperties {
    MessageProperties {
        content_type: Some(core.serializer.content_type().to_string()),
        timestamp: u64::try_from(Utc::now().timestamp()).ok(),
        persistent: core.config.persistent_delivery_mode,
        ..MessageProperties::default()
    }
    .with_header(MESSAGE_TYPE_HEADER, message_type)
}

/// Send on a leased channel, optionally waiting for the broker's confirm.
///
/// The ticket is registered before the message goes out and the lease is
/// given back before waiting, so a slow confirm never holds a channel.
pub(crate) async fn send(
    core: &BusCore,
    exchange: Option<&ExchangeDeclaration>,
    message: OutboundMessage,
    confirm: bool,
    confirm_timeout: Option<Duration>,
) -> Result<PublishOutcome> {
    if confirm && !core.config.publisher_confirms {
        return Err(BusError::Configuration(
            "publish confirm requested but publisher confirms are disabled".to_string(),
        ));
    }

    let lease = core.channels.acquire().await?;
    if let Some(exchange) = exchange {
        core.channels.topology().declare_exchange(&*lease, exchange).await?;
    }

    if !confirm {
        lease.publish(message).await?;
        debug!(channel = lease.key(), "Published without confirm");
        return Ok(PublishOutcome::Unconfirmed);
    }

    let key = TicketKey::new(lease.key(), lease.next_publish_seq());
    let ticket = core.channels.acknowledger().track(key, confirm_timeout)?;
    let timeout = ticket.timeout();
    lease.publish(message).await?;
    drop(lease);

    let outcome = match ticket.wait().await? {
        ConfirmOutcome::Acked => PublishOutcome::Acked,
        ConfirmOutcome::Nacked => {
            warn!(key = %key, "Broker nacked publish");
            PublishOutcome::Nacked(key)
        }
        ConfirmOutcome::TimedOut => PublishOutcome::TimedOut(timeout),
    };
    debug!(key = %key, ?outcome, "Publish settled");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(PublishOutcome::Acked.into_result().unwrap(), PublishOutcome::Acked);
        assert_eq!(
            PublishOutcome::Unconfirmed.into_result().unwrap(),
            PublishOutcome::Unconfirmed
        );

        let nack = PublishOutcome::Nacked(TicketKey::new(1, 2)).into_result().unwrap_err();
        assert!(matches!(nack, BusError::NegativeAcknowledgement(_)));

        let timeout = PublishOutcome::TimedOut(Duration::from_millis(100))
            .into_result()
            .unwrap_err();
        assert!(timeout.is_timeout());
    }

    #[test]
    fn test_options_builder() {
        let options = PublishOptions::new()
            .exchange("orders")
            .routing_key("orders.eu")
            .confirm_timeout(Duration::from_millis(250))
            .header("tenant", "acme");
        assert!(options.confirm);
        assert_eq!(options.exchange.as_deref(), Some("orders"));
        assert_eq!(options.headers.get("tenant").map(Vec::as_slice), Some(&b"acme"[..]));
    }
}
