// src/client.rs
// Composition of the bus components and the facade handed to applications.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, info_span, Span};

use crate::acknowledger::PublishAcknowledger;
use crate::broker::{BrokerConnector, LapinConnector};
use crate::channel_manager::ChannelManager;
use crate::config::BusConfig;
use crate::context::MessageContext;
use crate::error_handling::{DeadLetterStrategy, DefaultStrategy, ErrorHandlingStrategy};
use crate::errors::Result;
use crate::logging::component_span;
use crate::message::BusMessage;
use crate::naming::NamingConventions;
use crate::operations::{
    BusCore, HandlerError, PublishOptions, PublishOutcome, Publisher, RequestOptions, Requester, Responder,
    ResponderConfig, Subscriber, SubscriptionConfig, SubscriptionHandle,
};
use crate::serialization::{JsonMessageSerializer, TypeRegistry};
use crate::topology::TopologyProvider;

enum ErrorStrategyChoice {
    Default,
    DeadLetter,
    Custom(Arc<dyn ErrorHandlingStrategy>),
}

/// Wires a bus together. Every part has a default; only the configuration is
/// usually worth setting.
pub struct BusClientBuilder {
    config: BusConfig,
    connector: Option<Arc<dyn BrokerConnector>>,
    registry: TypeRegistry,
    naming: NamingConventions,
    error_strategy: ErrorStrategyChoice,
    span: Option<Span>,
}

impl BusClientBuilder {
    fn new() -> Self {
        Self {
            config: BusConfig::default(),
            connector: None,
            registry: TypeRegistry::new(),
            naming: NamingConventions::default(),
            error_strategy: ErrorStrategyChoice::Default,
            span: None,
        }
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker access. Defaults to a lapin connection built from the config.
    pub fn connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Make `T` decodable up front. Operations register their own types too.
    pub fn register<T: BusMessage>(self) -> Self {
        self.registry.register::<T>();
        self
    }

    pub fn naming(mut self, naming: NamingConventions) -> Self {
        self.naming = naming;
        self
    }

    /// Strategy used by subscriptions and responders that do not bring
    /// their own.
    pub fn error_strategy(mut self, strategy: Arc<dyn ErrorHandlingStrategy>) -> Self {
        self.error_strategy = ErrorStrategyChoice::Custom(strategy);
        self
    }

    /// Send failed deliveries to the error exchange of the naming conventions.
    pub fn dead_letter_errors(mut self) -> Self {
        self.error_strategy = ErrorStrategyChoice::DeadLetter;
        self
    }

    /// Parent span for everything the bus logs.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Validate the configuration, compose the components and open the
    /// connection.
    pub async fn connect(self) -> Result<BusClient> {
        let config = Arc::new(self.config.normalized().validated()?);
        let root = self
            .span
            .unwrap_or_else(|| info_span!("rabbit_bus", app = %config.application_name));

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(LapinConnector::new(config.clone())),
        };
        let acknowledger = Arc::new(PublishAcknowledger::new(config.publish_confirm_timeout()));
        let channels = Arc::new(ChannelManager::new(
            config.clone(),
            connector,
            Arc::new(TopologyProvider::new()),
            acknowledger,
            component_span(&root, "channel_manager"),
        ));
        channels.connect().await?;

        let error_strategy: Arc<dyn ErrorHandlingStrategy> = match self.error_strategy {
            ErrorStrategyChoice::Default => Arc::new(DefaultStrategy),
            ErrorStrategyChoice::DeadLetter => Arc::new(DeadLetterStrategy::new(
                channels.clone(),
                self.naming.error_exchange.clone(),
            )),
            ErrorStrategyChoice::Custom(strategy) => strategy,
        };
        let serializer = JsonMessageSerializer::new(Arc::new(self.registry))
            .with_options(config.serialization.clone());

        let core = BusCore::new(
            channels,
            Arc::new(serializer),
            self.naming,
            error_strategy,
            component_span(&root, "operations"),
        );
        info!(parent: &root, hosts = ?config.hostnames, "Bus connected");

        Ok(BusClient {
            core: Arc::new(core),
            span: root,
        })
    }
}

/// Entry point for applications: publish, subscribe, request and respond
/// over one shared connection. Cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    core: Arc<BusCore>,
    span: Span,
}

impl BusClient {
    /// Connect with defaults for everything but the configuration.
    pub async fn connect(config: BusConfig) -> Result<Self> {
        Self::builder().config(config).connect().await
    }

    pub fn builder() -> BusClientBuilder {
        BusClientBuilder::new()
    }

    pub fn config(&self) -> &Arc<BusConfig> {
        &self.core.config
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.core.channels
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        self.core.serializer.registry()
    }

    /// Fresh context carrying the global properties of this application.
    pub fn new_context(&self) -> MessageContext {
        self.core.contexts.create()
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.core.clone())
    }

    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.core.clone())
    }

    pub fn requester(&self) -> Requester {
        Requester::new(self.core.clone())
    }

    pub fn responder(&self) -> Responder {
        Responder::new(self.core.clone())
    }

    pub async fn publish<T: BusMessage>(&self, message: &T, options: PublishOptions) -> Result<PublishOutcome> {
        self.publisher().publish(message, options).await
    }

    pub async fn subscribe<T, F, Fut>(&self, config: SubscriptionConfig, handler: F) -> Result<SubscriptionHandle>
    where
        T: BusMessage,
        F: Fn(T, Arc<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.subscriber().subscribe(config, handler).await
    }

    pub async fn request<Req, Resp>(&self, request: &Req, options: RequestOptions) -> Result<Resp>
    where
        Req: BusMessage,
        Resp: BusMessage,
    {
        self.requester().request(request, options).await
    }

    pub async fn respond<Req, Resp, F, Fut>(&self, config: ResponderConfig, handler: F) -> Result<SubscriptionHandle>
    where
        Req: BusMessage,
        Resp: BusMessage,
        F: Fn(Req, Arc<MessageContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        self.responder().respond(config, handler).await
    }

    /// Stop all consumers, fail pending requests and close the connection.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.core.stop_consumers();
        self.core.channels.close().await?;
        info!(parent: &self.span, consumers = stopped, "Bus shut down");
        Ok(())
    }
}

impl fmt::Debug for BusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusClient")
            .field("application_name", &self.core.config.application_name)
            .field("channels", &self.core.channels)
            .finish()
    }
}
