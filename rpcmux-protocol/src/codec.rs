//! Serialization formats for frame headers and bodies.
//!
//! A connection negotiates exactly one [`CodecType`] up front; every header
//! and body that follows is encoded with it. Body encoding is generic over
//! the value type so the caller decides the shape at call time.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Content type tag for the dense binary codec.
pub const BINCODE_TYPE: &str = "application/bincode";

/// Content type tag for the textual codec.
pub const JSON_TYPE: &str = "application/json";

/// A serialization format usable for frames after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CodecType {
    /// Compact binary encoding via `bincode`.
    #[default]
    Bincode,
    /// UTF-8 JSON via `serde_json`.
    Json,
}

impl CodecType {
    /// Returns the canonical content-type tag.
    pub fn tag(&self) -> &'static str {
        match self {
            CodecType::Bincode => BINCODE_TYPE,
            CodecType::Json => JSON_TYPE,
        }
    }

    /// Serializes a value into a standalone buffer.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        match self {
            CodecType::Bincode => Ok(bincode::serialize(value)?),
            CodecType::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Deserializes a value from a buffer produced by [`CodecType::encode`].
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        match self {
            CodecType::Bincode => Ok(bincode::deserialize(bytes)?),
            CodecType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
