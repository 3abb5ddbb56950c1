// src/serialization/registry.rs

use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::message::BusMessage;

type DecodeFn = Arc<dyn Fn(Value) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync>;

/// A decoded payload whose concrete type was picked by its identifier.
pub struct DecodedMessage {
    pub message_type: String,
    value: Box<dyn Any + Send>,
}

impl DecodedMessage {
    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Recover the concrete value, or give the message back if `T` is wrong.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        match self.value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => Err(Self {
                message_type: self.message_type,
                value,
            }),
        }
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}

/// Maps stable type identifiers to decode functions.
///
/// Registration is idempotent; the registry is filled while the bus is being
/// composed and when operations are set up, and only read on the delivery path.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: RwLock<HashMap<String, DecodeFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: BusMessage>(&self) {
        let mut decoders = self.decoders.write().unwrap_or_else(PoisonError::into_inner);
        if decoders.contains_key(T::message_type()) {
            return;
        }
        debug!(message_type = T::message_type(), "Registering message type");
        let decode: DecodeFn = Arc::new(|value: Value| {
            let message: T = serde_json::from_value(value)?;
            Ok(Box::new(message) as Box<dyn Any + Send>)
        });
        decoders.insert(T::message_type().to_string(), decode);
    }

    pub fn with<T: BusMessage>(self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.decoders.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` if the identifier is unknown.
    pub(crate) fn decode(
        &self,
        message_type: &str,
        value: Value,
    ) -> Option<Result<DecodedMessage, serde_json::Error>> {
        let decode = self
            .decoders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_type)
            .cloned()?;
        Some(decode(value).map(|value| DecodedMessage {
            message_type: message_type.to_string(),
            value,
        }))
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decoders = self.decoders.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = decoders.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry").field("types", &names).finish()
    }
}
