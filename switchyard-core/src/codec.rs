//! Pluggable payload serialization.
//!
//! Every command carries a one-byte serializer code. The [`SerializerRegistry`]
//! maps that code to a [`Serializer`] in a 256-slot table indexed by the
//! signed byte, so lookup is a single array access.
//!
//! Serializers are object-safe: typed values go through [`serde_json::Value`]
//! on their way in and out, and the registry exposes generic helpers on top.
//!
//! # Example
//!
//! ```rust
//! use switchyard_core::{SERIALIZER_JSON, SerializerRegistry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Ping { seq: u32 }
//!
//! let registry = SerializerRegistry::with_defaults();
//! let bytes = registry.serialize(SERIALIZER_JSON, &Ping { seq: 1 }).expect("serialize");
//! assert_eq!(&bytes, br#"{"seq":1}"#);
//!
//! let decoded: Ping = registry.deserialize(SERIALIZER_JSON, &bytes).expect("deserialize");
//! assert_eq!(decoded, Ping { seq: 1 });
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Code of the built-in JSON serializer.
pub const SERIALIZER_JSON: i8 = 1;

const SLOTS: usize = 256;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No serializer is registered under the code.
    #[error("no serializer registered for code {code}")]
    UnknownSerializer {
        /// The code that was looked up.
        code: i8,
    },

    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Payload serialization format selected by a one-byte code.
pub trait Serializer: Send + Sync {
    /// Code carried on the wire.
    fn code(&self) -> i8;

    /// Human-readable name, for logs.
    fn name(&self) -> &'static str;

    /// Encode a value tree to bytes.
    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a value tree.
    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError>;
}

/// JSON serializer using serde_json.
#[derive(Clone, Default, Debug, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn code(&self) -> i8 {
        SERIALIZER_JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize_value(&self, value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// Table of serializers keyed by their signed one-byte code.
///
/// The first registration for a code wins; later ones are ignored so wiring
/// order does not matter.
pub struct SerializerRegistry {
    slots: RwLock<Vec<Option<Arc<dyn Serializer>>>>,
}

fn slot(code: i8) -> usize {
    (code as i16 + 128) as usize
}

impl SerializerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; SLOTS]),
        }
    }

    /// Create a registry holding the built-in [`JsonSerializer`].
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(JsonSerializer));
        registry
    }

    /// Register a serializer under its own code.
    ///
    /// Returns `false` if the code was already taken.
    pub fn register(&self, serializer: Arc<dyn Serializer>) -> bool {
        let mut slots = self.slots.write();
        let entry = &mut slots[slot(serializer.code())];
        if entry.is_some() {
            tracing::debug!(
                code = serializer.code(),
                name = serializer.name(),
                "serializer code already registered, ignoring"
            );
            return false;
        }
        *entry = Some(serializer);
        true
    }

    /// Look up a serializer by code.
    pub fn get(&self, code: i8) -> Option<Arc<dyn Serializer>> {
        self.slots.read()[slot(code)].clone()
    }

    /// Serialize a typed value with the serializer registered under `code`.
    pub fn serialize<T: Serialize>(&self, code: i8, value: &T) -> Result<Vec<u8>, CodecError> {
        let serializer = self.get(code).ok_or(CodecError::UnknownSerializer { code })?;
        let tree = serde_json::to_value(value).map_err(|e| CodecError::Encode(Box::new(e)))?;
        serializer.serialize_value(&tree)
    }

    /// Deserialize a typed value with the serializer registered under `code`.
    pub fn deserialize<T: DeserializeOwned>(&self, code: i8, bytes: &[u8]) -> Result<T, CodecError> {
        let serializer = self.get(code).ok_or(CodecError::UnknownSerializer { code })?;
        let tree = serializer.deserialize_value(bytes)?;
        serde_json::from_value(tree).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codes: Vec<i8> = self
            .slots
            .read()
            .iter()
            .flatten()
            .map(|s| s.code())
            .collect();
        f.debug_struct("SerializerRegistry")
            .field("codes", &codes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct TestMessage {
        id: u32,
        content: String,
    }

    struct ShoutingSerializer;

    impl Serializer for ShoutingSerializer {
        fn code(&self) -> i8 {
            SERIALIZER_JSON
        }

        fn name(&self) -> &'static str {
            "shouting"
        }

        fn serialize_value(&self, _value: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
            Ok(b"LOUD".to_vec())
        }

        fn deserialize_value(&self, _bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_json_roundtrip_through_registry() {
        let registry = SerializerRegistry::with_defaults();
        let msg = TestMessage {
            id: 42,
            content: "hello world".to_string(),
        };

        let bytes = registry.serialize(SERIALIZER_JSON, &msg).expect("encode");
        let decoded: TestMessage = registry.deserialize(SERIALIZER_JSON, &bytes).expect("decode");

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = SerializerRegistry::with_defaults();
        assert!(!registry.register(Arc::new(ShoutingSerializer)));

        let bytes = registry.serialize(SERIALIZER_JSON, &1u8).expect("encode");
        assert_eq!(&bytes, b"1");
    }

    #[test]
    fn test_extreme_codes_are_addressable() {
        struct Edge(i8);
        impl Serializer for Edge {
            fn code(&self) -> i8 {
                self.0
            }
            fn name(&self) -> &'static str {
                "edge"
            }
            fn serialize_value(&self, v: &serde_json::Value) -> Result<Vec<u8>, CodecError> {
                JsonSerializer.serialize_value(v)
            }
            fn deserialize_value(&self, b: &[u8]) -> Result<serde_json::Value, CodecError> {
                JsonSerializer.deserialize_value(b)
            }
        }

        let registry = SerializerRegistry::new();
        assert!(registry.register(Arc::new(Edge(i8::MIN))));
        assert!(registry.register(Arc::new(Edge(i8::MAX))));
        assert_eq!(registry.get(i8::MIN).map(|s| s.code()), Some(i8::MIN));
        assert_eq!(registry.get(i8::MAX).map(|s| s.code()), Some(i8::MAX));
        assert!(registry.get(0).is_none());
    }

    #[test]
    fn test_unknown_serializer() {
        let registry = SerializerRegistry::new();
        let result = registry.serialize(5, &"x");
        assert!(matches!(result, Err(CodecError::UnknownSerializer { code: 5 })));
    }

    #[test]
    fn test_decode_error() {
        let registry = SerializerRegistry::with_defaults();
        let result: Result<TestMessage, _> = registry.deserialize(SERIALIZER_JSON, b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
