//! Typed publish/subscribe and request/response over RabbitMQ.
//!
//! A [`BusClient`] owns one broker connection and hands out lightweight
//! publishers, subscribers, requesters and responders over it. Payloads are
//! JSON with the message type carried in the `message_type` header, so the
//! receiving side can pick the right decoder from its [`TypeRegistry`].

pub mod acknowledger;
pub mod broker;
pub mod channel_manager;
pub mod client;
pub mod config;
pub mod context;
pub mod error_handling;
pub mod errors;
pub mod logging;
pub mod message;
pub mod naming;
pub mod operations;
pub mod serialization;
pub mod topology;

pub use acknowledger::{ConfirmOutcome, PublishAcknowledger, TicketKey};
pub use broker::LapinConnector;
#[cfg(feature = "memory-broker")]
pub use broker::MemoryBroker;
pub use client::{BusClient, BusClientBuilder};
pub use config::{load_config, BusConfig, RecoveryMode};
pub use context::{ContextProvider, MessageContext};
pub use error_handling::{
    DeadLetterStrategy, DefaultStrategy, Disposition, ErrorHandlingStrategy, FailureKind, LimitedRequeueStrategy,
    ProcessingFailure,
};
pub use errors::{BusError, Result};
pub use message::BusMessage;
pub use naming::NamingConventions;
pub use operations::{
    HandlerError, PublishOptions, PublishOutcome, RequestOptions, ResponderConfig, SubscriptionConfig,
    SubscriptionHandle,
};
pub use serialization::{JsonMessageSerializer, SerializerOptions, TypeRegistry};
