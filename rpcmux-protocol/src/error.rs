//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors raised during negotiation, framing or (de)serialization.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic number: {0:#x}")]
    InvalidMagic(u32),

    #[error("unknown codec type: {0:?}")]
    UnknownCodec(String),

    #[error("negotiation descriptor exceeds {max} bytes")]
    DescriptorTooLarge { max: usize },

    #[error("segment too large: {size} bytes (max {max})")]
    SegmentTooLarge { size: u32, max: u32 },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the error leaves the byte stream in an unknown position.
    ///
    /// Serialization errors happen after a whole segment has been consumed, so
    /// the next frame can still be read. Everything else is fatal for the
    /// connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Json(_) | ProtocolError::Bincode(_))
    }
}
