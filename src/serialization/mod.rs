//! Payload encoding with embedded type identity.

mod json;
pub mod registry;

pub use json::{JsonMessageSerializer, SerializerOptions, INLINE_TYPE_FIELD};
pub use registry::{DecodedMessage, TypeRegistry};
