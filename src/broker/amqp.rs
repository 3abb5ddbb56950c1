// src/broker/amqp.rs
// lapin-backed implementation of the broker traits.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    tcp::OwnedTLSConfig,
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, DeliveryStream, Settlement};
use crate::config::BusConfig;
use crate::errors::{BusError, Result};
use crate::message::{InboundDelivery, MessageProperties, OutboundMessage};
use crate::topology::{BindingDeclaration, ExchangeDeclaration, ExchangeType, QueueDeclaration};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Connects to RabbitMQ through lapin, trying each configured host in turn.
pub struct LapinConnector {
    config: Arc<BusConfig>,
}

impl LapinConnector {
    pub fn new(config: Arc<BusConfig>) -> Self {
        Self { config }
    }

    // Outer None: plain TCP. Inner value: PEM chain of a custom CA.
    fn tls_settings(&self) -> Result<Option<Option<String>>> {
        if !self.config.tls.enabled {
            return Ok(None);
        }
        match &self.config.tls.ca_certificate_path {
            Some(path) => std::fs::read_to_string(path).map(|pem| Some(Some(pem))).map_err(|e| {
                BusError::Configuration(format!("failed to read CA certificate {}: {}", path.display(), e))
            }),
            None => Ok(Some(None)),
        }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let tls = self.tls_settings()?;
        let mut last_error = None;

        for (host, uri) in self.config.hostnames.iter().zip(self.config.amqp_uris()) {
            let properties =
                ConnectionProperties::default().with_connection_name(self.config.application_name.clone().into());

            info!(host = %host, port = self.config.port, vhost = %self.config.virtual_host, "Connecting to RabbitMQ");
            let attempt = match &tls {
                Some(cert_chain) => {
                    let tls_config = OwnedTLSConfig {
                        identity: None,
                        cert_chain: cert_chain.clone(),
                    };
                    Connection::connect_uri_with_config(uri, properties, tls_config).await
                }
                None => Connection::connect_uri(uri, properties).await,
            };

            match attempt {
                Ok(connection) => {
                    info!(host = %host, "Connected to RabbitMQ");
                    return Ok(Arc::new(LapinConnection { connection }));
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Failed to connect to RabbitMQ host");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => BusError::Connection(format!("no broker host reachable: {}", e)),
            None => BusError::Configuration("no broker hostnames configured".to_string()),
        })
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(LapinChannel {
            channel,
            confirms: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            confirm_sender: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            info!("Closing RabbitMQ connection");
            self.connection.close(200, "Bye").await?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
    confirms: AtomicBool,
    // lapin numbers publishes from 1 after confirm.select; this mirrors it.
    next_seq: AtomicU64,
    confirm_sender: Mutex<Option<mpsc::UnboundedSender<ConfirmEvent>>>,
}

impl LapinChannel {
    fn confirm_sender(&self) -> Option<mpsc::UnboundedSender<ConfirmEvent>> {
        self.confirm_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<()> {
        let kind = match exchange.kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Headers => ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                &exchange.name,
                kind,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, binding: &BindingDeclaration) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<mpsc::UnboundedReceiver<ConfirmEvent>> {
        self.channel.confirm_select(ConfirmSelectOptions::default()).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.confirm_sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        self.confirms.store(true, Ordering::Release);
        debug!(channel_id = self.channel.id(), "Enabled publisher confirms");
        Ok(receiver)
    }

    fn next_publish_seq(&self) -> u64 {
        if self.confirms.load(Ordering::Acquire) {
            self.next_seq.load(Ordering::Acquire)
        } else {
            0
        }
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let properties = to_basic_properties(&message.properties);
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?;

        if !self.confirms.load(Ordering::Acquire) {
            return Ok(());
        }

        let sequence = self.next_seq.fetch_add(1, Ordering::AcqRel);
        let Some(sender) = self.confirm_sender() else {
            return Ok(());
        };
        let channel_id = self.channel.id();
        tokio::spawn(async move {
            let event = match confirm.await {
                Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => ConfirmEvent::Ack {
                    sequence,
                    multiple: false,
                },
                Ok(Confirmation::Nack(_)) => ConfirmEvent::Nack {
                    sequence,
                    multiple: false,
                },
                Err(e) => {
                    warn!(channel_id, sequence, error = %e, "Publisher confirm lost");
                    ConfirmEvent::Lost { sequence }
                }
            };
            let _ = sender.send(event);
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        info!(queue, consumer_tag, prefetch, "Started consumer");
        let deliveries = consumer.map(|result| {
            result.map_err(BusError::from).map(|delivery| InboundDelivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                properties: from_basic_properties(&delivery.properties),
                payload: delivery.data,
            })
        });
        Ok(deliveries.boxed())
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> Result<()> {
        match settlement {
            Settlement::Ack => {
                self.channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await?
            }
            Settlement::Nack { requeue } => {
                self.channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue,
                        },
                    )
                    .await?
            }
            Settlement::Reject { requeue } => {
                self.channel
                    .basic_reject(delivery_tag, BasicRejectOptions { requeue })
                    .await?
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.confirm_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Bye").await {
                error!(channel_id = self.channel.id(), error = %e, "Failed to close channel");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(if properties.persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        TRANSIENT_DELIVERY_MODE
    });

    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }

    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (name, value) in &properties.headers {
            let value = match String::from_utf8(value.clone()) {
                Ok(text) => AMQPValue::LongString(LongString::from(text)),
                Err(raw) => AMQPValue::ByteArray(ByteArray::from(raw.into_bytes())),
            };
            headers.insert(ShortString::from(name.clone()), value);
        }
        basic = basic.with_headers(headers);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = basic.headers() {
        for (name, value) in table.inner() {
            let raw = match value {
                AMQPValue::LongString(text) => text.as_bytes().to_vec(),
                AMQPValue::ShortString(text) => text.as_str().as_bytes().to_vec(),
                AMQPValue::ByteArray(bytes) => bytes.as_slice().to_vec(),
                // Other header types are not produced by the bus.
                _ => continue,
            };
            headers.insert(name.to_string(), raw);
        }
    }

    MessageProperties {
        message_id: basic.message_id().as_ref().map(ToString::to_string),
        correlation_id: basic.correlation_id().as_ref().map(ToString::to_string),
        reply_to: basic.reply_to().as_ref().map(ToString::to_string),
        content_type: basic.content_type().as_ref().map(ToString::to_string),
        timestamp: *basic.timestamp(),
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}
