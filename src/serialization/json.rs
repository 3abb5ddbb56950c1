// src/serialization/json.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::registry::{DecodedMessage, TypeRegistry};
use crate::errors::Result;
use crate::message::{BusMessage, MessageProperties, JSON_CONTENT_TYPE};

/// Object member used when the type identifier travels inside the payload.
pub const INLINE_TYPE_FIELD: &str = "$type";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializerOptions {
    /// Drop `null` object members instead of writing them.
    #[serde(default = "default_omit_nulls")]
    pub omit_nulls: bool,

    /// Also write the type identifier as a `$type` member of top-level objects.
    #[serde(default)]
    pub inline_type: bool,
}

fn default_omit_nulls() -> bool {
    true
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            omit_nulls: default_omit_nulls(),
            inline_type: false,
        }
    }
}

/// JSON payload codec.
///
/// The `message_type` header wins over an inline `$type` member; the inline
/// member is only read when the header is missing.
#[derive(Debug, Clone)]
pub struct JsonMessageSerializer {
    options: SerializerOptions,
    registry: Arc<TypeRegistry>,
}

impl JsonMessageSerializer {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            options: SerializerOptions::default(),
            registry,
        }
    }

    pub fn with_options(mut self, options: SerializerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    /// Encode a bus message. `None` encodes to an empty payload.
    pub fn serialize<T: BusMessage>(&self, message: Option<&T>) -> Result<Vec<u8>> {
        self.serialize_value(message, Some(T::message_type()))
    }

    pub fn serialize_value<T: Serialize + ?Sized>(
        &self,
        value: Option<&T>,
        message_type: Option<&str>,
    ) -> Result<Vec<u8>> {
        let Some(value) = value else {
            return Ok(Vec::new());
        };

        let mut tree = serde_json::to_value(value)?;
        if self.options.omit_nulls {
            strip_nulls(&mut tree);
        }
        if self.options.inline_type {
            if let (Some(name), Value::Object(members)) = (message_type, &mut tree) {
                members.insert(INLINE_TYPE_FIELD.to_string(), Value::String(name.to_string()));
            }
        }

        Ok(serde_json::to_vec(&tree)?)
    }

    /// Decode through the type registry. Yields `None` when no type identity
    /// can be resolved, the identity is unregistered, or the payload does not
    /// fit the registered type.
    pub fn deserialize(&self, bytes: &[u8], properties: &MessageProperties) -> Option<DecodedMessage> {
        let (message_type, tree) = self.resolve(bytes, properties)?;

        match self.registry.decode(&message_type, tree) {
            Some(Ok(decoded)) => Some(decoded),
            Some(Err(e)) => {
                warn!(message_type = %message_type, error = %e, "Payload does not match registered type");
                None
            }
            None => {
                debug!(message_type = %message_type, "No decoder registered for message type");
                None
            }
        }
    }

    /// Decode into a statically known type. The resolved type identity must
    /// match `T`.
    pub fn deserialize_as<T: BusMessage>(&self, bytes: &[u8], properties: &MessageProperties) -> Option<T> {
        let (message_type, tree) = self.resolve(bytes, properties)?;
        if message_type != T::message_type() {
            debug!(
                expected = T::message_type(),
                actual = %message_type,
                "Message type mismatch"
            );
            return None;
        }

        serde_json::from_value(tree)
            .map_err(|e| warn!(message_type = %message_type, error = %e, "Failed to decode payload"))
            .ok()
    }

    fn resolve(&self, bytes: &[u8], properties: &MessageProperties) -> Option<(String, Value)> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let mut tree: Value = match serde_json::from_slice(bytes) {
            Ok(tree) => tree,
            Err(e) => {
                debug!(error = %e, "Payload is not valid JSON");
                return None;
            }
        };

        let inline = match &mut tree {
            Value::Object(members) => match members.remove(INLINE_TYPE_FIELD) {
                Some(Value::String(name)) => Some(name),
                _ => None,
            },
            _ => None,
        };

        let message_type = properties
            .message_type()
            .map(str::to_string)
            .or(inline)
            .filter(|name| !name.is_empty())?;

        Some((message_type, tree))
    }
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(members) => {
            members.retain(|_, member| !member.is_null());
            members.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}
