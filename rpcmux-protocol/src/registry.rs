//! Codec registry.
//!
//! Maps negotiated content-type tags to [`CodecType`]s. A registry is an
//! ordinary value built at startup and handed to clients and servers, so two
//! servers in one process can accept different codec sets.

use crate::codec::{CodecType, BINCODE_TYPE, JSON_TYPE};
use crate::error::ProtocolError;
use std::collections::HashMap;

/// Lookup table from content-type tag to codec.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, CodecType>,
}

impl CodecRegistry {
    /// Creates a registry with no codecs. Every negotiation against it fails.
    pub fn new() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Creates a registry holding the built-in bincode and JSON codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BINCODE_TYPE, CodecType::Bincode);
        registry.register(JSON_TYPE, CodecType::Json);
        registry
    }

    /// Registers a codec under a tag, returning the codec it replaced.
    pub fn register(&mut self, tag: impl Into<String>, codec: CodecType) -> Option<CodecType> {
        self.codecs.insert(tag.into(), codec)
    }

    /// Removes a tag from the registry.
    pub fn unregister(&mut self, tag: &str) -> Option<CodecType> {
        self.codecs.remove(tag)
    }

    /// Resolves a negotiated tag.
    pub fn resolve(&self, tag: &str) -> Result<CodecType, ProtocolError> {
        self.codecs
            .get(tag)
            .copied()
            .ok_or_else(|| ProtocolError::UnknownCodec(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.codecs.contains_key(tag)
    }

    /// Returns the registered tags in sorted order.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
