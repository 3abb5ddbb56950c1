// src/context.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::message::{MessageProperties, MESSAGE_CONTEXT_HEADER};

pub const ORIGINATING_APP_PROPERTY: &str = "originating_app";
pub const TIMESTAMP_PROPERTY: &str = "timestamp";

/// Per-message envelope handed to handlers alongside the payload.
///
/// The id and global properties travel in the `message_context` header; the
/// correlation id and reply destination use the native AMQP properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    pub message_id: Uuid,

    #[serde(skip)]
    pub correlation_id: Option<String>,

    #[serde(skip)]
    pub reply_to: Option<String>,

    #[serde(default)]
    pub global_properties: BTreeMap<String, Value>,
}

impl MessageContext {
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: None,
            reply_to: None,
            global_properties: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.global_properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.global_properties.get(name)
    }

    pub fn originating_app(&self) -> Option<&str> {
        self.property(ORIGINATING_APP_PROPERTY).and_then(Value::as_str)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.property(TIMESTAMP_PROPERTY)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates contexts for outgoing messages and rebuilds them from deliveries.
#[derive(Debug, Clone)]
pub struct ContextProvider {
    application_name: String,
}

impl ContextProvider {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
        }
    }

    /// Fresh context stamped with the global properties of this process.
    pub fn create(&self) -> MessageContext {
        self.stamp(MessageContext::new())
    }

    /// Fill in global properties the caller did not set.
    pub fn stamp(&self, mut context: MessageContext) -> MessageContext {
        context
            .global_properties
            .entry(ORIGINATING_APP_PROPERTY.to_string())
            .or_insert_with(|| Value::String(self.application_name.clone()));
        context
            .global_properties
            .entry(TIMESTAMP_PROPERTY.to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        context
    }

    /// Write the context onto outgoing properties.
    pub fn apply(&self, context: &MessageContext, properties: &mut MessageProperties) -> crate::errors::Result<()> {
        properties.message_id = Some(context.message_id.to_string());
        if context.correlation_id.is_some() {
            properties.correlation_id = context.correlation_id.clone();
        }
        if context.reply_to.is_some() {
            properties.reply_to = context.reply_to.clone();
        }
        properties
            .headers
            .insert(MESSAGE_CONTEXT_HEADER.to_string(), serde_json::to_vec(context)?);
        Ok(())
    }

    /// Rebuild the context of a delivery. A missing or broken context header
    /// gives a fresh context rather than an error.
    pub fn extract(&self, properties: &MessageProperties) -> MessageContext {
        let mut context = properties
            .headers
            .get(MESSAGE_CONTEXT_HEADER)
            .and_then(|raw| {
                serde_json::from_slice::<MessageContext>(raw)
                    .map_err(|e| debug!(error = %e, "Ignoring unreadable message context header"))
                    .ok()
            })
            .unwrap_or_else(|| {
                let mut context = MessageContext::new();
                if let Some(id) = properties.message_id.as_deref().and_then(|id| Uuid::parse_str(id).ok()) {
                    context.message_id = id;
                }
                context
            });

        context.correlation_id = properties.correlation_id.clone();
        context.reply_to = properties.reply_to.clone();
        context
    }
}
