// src/message.rs
// Message trait and the transport-neutral envelope types handed to a broker channel.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Header carrying the stable type identifier of the payload.
pub const MESSAGE_TYPE_HEADER: &str = "message_type";
/// Header carrying the serialized global properties of the message context.
pub const MESSAGE_CONTEXT_HEADER: &str = "message_context";
/// Header set by the dead-letter strategy.
pub const FAILURE_REASON_HEADER: &str = "x-failure-reason";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A type that can travel over the bus.
///
/// `message_type` must be stable across producer and consumer versions; it is
/// what the receiving side uses to pick a decoder.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier, e.g. `"orders.created"`.
    fn message_type() -> &'static str;

    /// Routing key used when the publisher is not given one.
    fn routing_key() -> &'static str {
        Self::message_type()
    }
}

/// AMQP basic properties the bus cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Seconds since the epoch.
    pub timestamp: Option<u64>,
    pub persistent: bool,
    pub headers: BTreeMap<String, Vec<u8>>,
}

impl MessageProperties {
    /// Header value decoded as UTF-8, if present and valid.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|raw| std::str::from_utf8(raw).ok())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Type identifier from the `message_type` header.
    pub fn message_type(&self) -> Option<&str> {
        self.header_str(MESSAGE_TYPE_HEADER).filter(|t| !t.is_empty())
    }
}

/// Everything needed for one `basic.publish`.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// A message received from a consumer.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}
