//! Codec (serde) capabilities and the codec registry.
//!
//! A [`Codec`] is the encode/decode capability attached to one side of a
//! record when it crosses a topic boundary. At assembly time codecs are
//! opaque handles carried through the graph; the compiler never invokes
//! them. Either component of a [`CodecPair`] may be absent ("unspecified"),
//! which is not an error by itself -- it only surfaces as a failure when a
//! runtime actually needs to encode or decode and finds neither a codec nor
//! a default.
//!
//! Records are type-erased at the graph layer: a [`DynValue`] is an
//! `Arc<dyn Any + Send + Sync>`. The typed DSL wraps user closures and
//! downcasts on entry, so a mismatch is reported as a runtime processing
//! error rather than a panic.

pub mod propagation;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;

/// A type-erased record key or value.
pub type DynValue = Arc<dyn Any + Send + Sync>;

/// Erases a concrete value into a [`DynValue`].
pub fn erase<T: Send + Sync + 'static>(value: T) -> DynValue {
    Arc::new(value)
}

/// Downcasts a [`DynValue`] back to a concrete type.
///
/// # Errors
///
/// Returns [`CodecError::TypeMismatch`] if the value holds a different type.
pub fn downcast_value<T: Send + Sync + 'static>(value: &DynValue) -> Result<&T, CodecError> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
}

/// Errors raised by codec implementations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value handed to a codec holds a different runtime type.
    #[error("value does not hold the expected type {expected}")]
    TypeMismatch {
        /// The type the caller expected.
        expected: &'static str,
    },

    /// A byte payload could not be decoded.
    #[error("codec '{codec}' failed to decode: {reason}")]
    Decode {
        /// Name of the codec that failed.
        codec: &'static str,
        /// Description of the failure.
        reason: String,
    },
}

/// Encode/decode capability for one side of a record.
///
/// Implementations work over type-erased values; the registry keys them by
/// the concrete type they handle.
pub trait Codec: Send + Sync {
    /// Short stable name, used in diagnostics and tests.
    fn name(&self) -> &'static str;

    /// Encodes a value into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if the value holds a type this
    /// codec does not handle.
    fn encode(&self, value: &DynValue) -> Result<Vec<u8>, CodecError>;

    /// Decodes bytes back into a value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the payload is malformed.
    fn decode(&self, bytes: &[u8]) -> Result<DynValue, CodecError>;
}

/// Shared handle to a codec.
pub type CodecRef = Arc<dyn Codec>;

/// The (key codec, value codec) pair attached to a node's output.
///
/// Either component may be `None` ("unspecified"): downstream consumers must
/// supply their own or fail at execution time, never at compile time.
#[derive(Clone, Default)]
pub struct CodecPair {
    /// Key codec, if specified.
    pub key: Option<CodecRef>,
    /// Value codec, if specified.
    pub value: Option<CodecRef>,
}

impl CodecPair {
    /// A pair with both components specified.
    #[must_use]
    pub fn new(key: CodecRef, value: CodecRef) -> Self {
        Self {
            key: Some(key),
            value: Some(value),
        }
    }

    /// A fully unspecified pair.
    #[must_use]
    pub fn unspecified() -> Self {
        Self::default()
    }

    /// Returns true if both components are specified.
    #[must_use]
    pub fn is_fully_specified(&self) -> bool {
        self.key.is_some() && self.value.is_some()
    }

    /// Overlays `over` onto `self`: components of `over` win where present.
    #[must_use]
    pub fn overlay(&self, over: &CodecPair) -> CodecPair {
        CodecPair {
            key: over.key.clone().or_else(|| self.key.clone()),
            value: over.value.clone().or_else(|| self.value.clone()),
        }
    }

    /// Name of the key codec, if specified.
    #[must_use]
    pub fn key_name(&self) -> Option<&'static str> {
        self.key.as_ref().map(|c| c.name())
    }

    /// Name of the value codec, if specified.
    #[must_use]
    pub fn value_name(&self) -> Option<&'static str> {
        self.value.as_ref().map(|c| c.name())
    }
}

impl fmt::Debug for CodecPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CodecPair(key={}, value={})",
            self.key_name().unwrap_or("<unspecified>"),
            self.value_name().unwrap_or("<unspecified>"),
        )
    }
}

/// UTF-8 string codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    fn name(&self) -> &'static str {
        "string"
    }

    fn encode(&self, value: &DynValue) -> Result<Vec<u8>, CodecError> {
        Ok(downcast_value::<String>(value)?.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynValue, CodecError> {
        let s = std::str::from_utf8(bytes).map_err(|e| CodecError::Decode {
            codec: self.name(),
            reason: e.to_string(),
        })?;
        Ok(erase(s.to_string()))
    }
}

/// Big-endian `i64` codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct I64Codec;

impl Codec for I64Codec {
    fn name(&self) -> &'static str {
        "i64"
    }

    fn encode(&self, value: &DynValue) -> Result<Vec<u8>, CodecError> {
        Ok(downcast_value::<i64>(value)?.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynValue, CodecError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| CodecError::Decode {
            codec: self.name(),
            reason: format!("expected 8 bytes, got {}", bytes.len()),
        })?;
        Ok(erase(i64::from_be_bytes(arr)))
    }
}

/// Pass-through `Vec<u8>` codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, value: &DynValue) -> Result<Vec<u8>, CodecError> {
        Ok(downcast_value::<Vec<u8>>(value)?.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynValue, CodecError> {
        Ok(erase(bytes.to_vec()))
    }
}

/// Maps declared key/value types to codec capabilities.
///
/// Lookup by type never fails hard: an unregistered type simply yields an
/// unspecified component in the resulting [`CodecPair`].
#[derive(Default)]
pub struct CodecRegistry {
    by_type: FxHashMap<TypeId, CodecRef>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry preloaded with the builtin codecs
    /// (`String`, `i64`, `Vec<u8>`).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<String>(Arc::new(StringCodec));
        registry.register::<i64>(Arc::new(I64Codec));
        registry.register::<Vec<u8>>(Arc::new(BytesCodec));
        registry
    }

    /// Registers a codec for type `T`, replacing any previous registration.
    pub fn register<T: 'static>(&mut self, codec: CodecRef) {
        self.by_type.insert(TypeId::of::<T>(), codec);
    }

    /// Looks up the codec registered for type `T`.
    #[must_use]
    pub fn lookup<T: 'static>(&self) -> Option<CodecRef> {
        self.by_type.get(&TypeId::of::<T>()).cloned()
    }

    /// Resolves the codec pair for a declared key/value type pair.
    ///
    /// Unregistered types yield unspecified components.
    #[must_use]
    pub fn pair_for<K: 'static, V: 'static>(&self) -> CodecPair {
        CodecPair {
            key: self.lookup::<K>(),
            value: self.lookup::<V>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_codec_round_trip() {
        let codec = StringCodec;
        let bytes = codec.encode(&erase("hello".to_string())).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(downcast_value::<String>(&back).unwrap(), "hello");
    }

    #[test]
    fn test_string_codec_rejects_wrong_type() {
        let codec = StringCodec;
        let result = codec.encode(&erase(7_i64));
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));
    }

    #[test]
    fn test_i64_codec_rejects_short_payload() {
        let codec = I64Codec;
        let result = codec.decode(&[1, 2, 3]);
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }

    #[test]
    fn test_registry_lookup_by_type() {
        let registry = CodecRegistry::with_defaults();
        let pair = registry.pair_for::<String, i64>();
        assert_eq!(pair.key_name(), Some("string"));
        assert_eq!(pair.value_name(), Some("i64"));
        assert!(pair.is_fully_specified());

        let missing = registry.pair_for::<u32, String>();
        assert!(missing.key.is_none());
        assert_eq!(missing.value_name(), Some("string"));
        assert!(!missing.is_fully_specified());
        assert!(!CodecPair::unspecified().is_fully_specified());
    }

    #[test]
    fn test_overlay_component_wise() {
        let registry = CodecRegistry::with_defaults();
        let base = registry.pair_for::<String, String>();
        let over = CodecPair {
            key: registry.lookup::<i64>(),
            value: None,
        };
        let merged = base.overlay(&over);
        assert_eq!(merged.key_name(), Some("i64"));
        assert_eq!(merged.value_name(), Some("string"));
    }
}
