// src/operations/mod.rs
// Publish, subscribe, request and respond over the shared bus components.

pub(crate) mod consumer;
pub mod publisher;
pub mod requester;
pub mod responder;
pub mod subscriber;

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use tracing::Span;

use crate::channel_manager::ChannelManager;
use crate::config::BusConfig;
use crate::context::ContextProvider;
use crate::error_handling::ErrorHandlingStrategy;
use crate::errors::BusError;
use crate::naming::NamingConventions;
use crate::serialization::JsonMessageSerializer;

pub use publisher::{PublishOptions, PublishOutcome, Publisher};
pub use requester::{RequestOptions, Requester};
pub use responder::{Responder, ResponderConfig};
pub use subscriber::{SubscriptionConfig, SubscriptionHandle, Subscriber};

/// Error type handlers return. Anything printable works.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Long-lived components shared by every operation of one bus.
pub(crate) struct BusCore {
    pub config: Arc<BusConfig>,
    pub channels: Arc<ChannelManager>,
    pub serializer: Arc<JsonMessageSerializer>,
    pub contexts: ContextProvider,
    pub naming: NamingConventions,
    pub error_strategy: Arc<dyn ErrorHandlingStrategy>,
    pub pending: requester::PendingRequests,
    pub reply_queue: OnceCell<String>,
    consumers: Mutex<Vec<AbortHandle>>,
    pub span: Span,
}

impl BusCore {
    pub fn new(
        channels: Arc<ChannelManager>,
        serializer: Arc<JsonMessageSerializer>,
        naming: NamingConventions,
        error_strategy: Arc<dyn ErrorHandlingStrategy>,
        span: Span,
    ) -> Self {
        let config = channels.config().clone();
        Self {
            contexts: ContextProvider::new(config.application_name.clone()),
            config,
            channels,
            serializer,
            naming,
            error_strategy,
            pending: requester::PendingRequests::default(),
            reply_queue: OnceCell::new(),
            consumers: Mutex::new(Vec::new()),
            span,
        }
    }

    pub(crate) fn track_consumer(&self, handle: AbortHandle) {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        consumers.retain(|h| !h.is_finished());
        consumers.push(handle);
    }

    /// Stop every consumer loop and fail every pending request.
    pub(crate) fn stop_consumers(&self) -> usize {
        let consumers: Vec<AbortHandle> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for consumer in &consumers {
            consumer.abort();
        }
        self.pending.fail_all(|| BusError::Shutdown);
        consumers.len()
    }
}
