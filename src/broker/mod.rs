// src/broker/mod.rs
// The seam between the bus and the AMQP client library.

pub mod amqp;
#[cfg(feature = "memory-broker")]
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::message::{InboundDelivery, OutboundMessage};
use crate::topology::{BindingDeclaration, ExchangeDeclaration, QueueDeclaration};

pub use amqp::LapinConnector;
#[cfg(feature = "memory-broker")]
pub use memory::MemoryBroker;

pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

/// Publisher confirm as reported by a channel in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmEvent {
    Ack { sequence: u64, multiple: bool },
    Nack { sequence: u64, multiple: bool },
    /// The confirm for this sequence number will never arrive.
    Lost { sequence: u64 },
}

/// How a consumed delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// Opens connections. Implementations own the addressing and credentials.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// One AMQP channel.
///
/// A channel is used by one operation at a time; `next_publish_seq` is only
/// meaningful while the caller holds it exclusively.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<()>;

    async fn bind_queue(&self, binding: &BindingDeclaration) -> Result<()>;

    /// Switch to confirm mode. Confirms for later publishes arrive on the
    /// returned receiver, which closes when the channel does.
    async fn enable_confirms(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>>;

    /// Sequence number the next publish will get, starting at 1 once confirm
    /// mode is on. Zero when confirms are off.
    fn next_publish_seq(&self) -> u64;

    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
