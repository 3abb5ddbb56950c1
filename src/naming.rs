// src/naming.rs
// Default exchange and queue names derived from message types.

use uuid::Uuid;

use crate::topology::ExchangeType;

const REPLY_QUEUE_PREFIX: &str = "rpc.response";

/// Derives broker names for operations whose caller did not pick them.
///
/// A message type `orders.created` publishes to exchange `orders` with
/// routing key `orders.created`; a type without a dot publishes to an
/// exchange of its own name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConventions {
    pub exchange_type: ExchangeType,
    pub request_exchange: String,
    pub error_exchange: String,
}

impl Default for NamingConventions {
    fn default() -> Self {
        Self {
            exchange_type: ExchangeType::Topic,
            request_exchange: "default_request_exchange".to_string(),
            error_exchange: "default_error_exchange".to_string(),
        }
    }
}

impl NamingConventions {
    pub fn exchange_for(&self, message_type: &str) -> String {
        match message_type.rfind('.') {
            Some(index) if index > 0 => message_type[..index].to_string(),
            _ => message_type.to_string(),
        }
    }

    /// Queue of one subscriber. Subscribers sharing an id compete for messages.
    pub fn queue_for(&self, message_type: &str, subscriber_id: Option<&str>) -> String {
        match subscriber_id {
            Some(id) if !id.is_empty() => format!("{}_{}", message_type, id),
            _ => message_type.to_string(),
        }
    }

    pub fn request_queue_for(&self, message_type: &str) -> String {
        format!("{}.requests", message_type)
    }

    /// Fresh name for a private reply queue.
    pub fn reply_queue(&self) -> String {
        format!("{}.{}", REPLY_QUEUE_PREFIX, Uuid::new_v4())
    }

    pub fn consumer_tag(&self) -> String {
        format!("consumer-{}", &Uuid::new_v4().simple().to_string()[..8])
    }
}
