//! Connection negotiation.
//!
//! The initiator opens every connection with one [`Descriptor`] encoded as a
//! single newline-terminated JSON object, independent of the codec it names:
//!
//! ```text
//! | {"MagicNumber":3927900,"CodecType":"application/bincode"}\n | Header | Body | Header | Body | ...
//! | <------------------- fixed JSON ----------------------->   | <---- negotiated codec ---->   |
//! ```
//!
//! The receiver checks the magic number and resolves the codec tag before it
//! trusts any frame.

use crate::codec::CodecType;
use crate::error::ProtocolError;
use crate::registry::CodecRegistry;
use crate::{MAGIC_NUMBER, MAX_DESCRIPTOR_SIZE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The handshake record sent once at the start of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,
    #[serde(rename = "CodecType")]
    pub codec_type: String,
}

impl Descriptor {
    /// Creates a descriptor with the protocol magic number.
    pub fn new(codec_type: impl Into<String>) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec_type.into(),
        }
    }

    /// Validates the descriptor and resolves the codec it names.
    pub fn validate(&self, registry: &CodecRegistry) -> Result<CodecType, ProtocolError> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(ProtocolError::InvalidMagic(self.magic_number));
        }
        registry.resolve(&self.codec_type)
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new(CodecType::default().tag())
    }
}

/// Writes a descriptor as one JSON line and flushes it.
pub async fn write_descriptor<W>(
    writer: &mut W,
    descriptor: &Descriptor,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(descriptor)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one descriptor line.
///
/// Reads at most [`MAX_DESCRIPTOR_SIZE`] bytes and never consumes past the
/// terminating newline, so frame bytes that arrived in the same packet stay
/// in the reader's buffer.
pub async fn read_descriptor<R>(reader: &mut R) -> Result<Descriptor, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let n = reader
        .take(MAX_DESCRIPTOR_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if line.last() != Some(&b'\n') {
        if n >= MAX_DESCRIPTOR_SIZE {
            return Err(ProtocolError::DescriptorTooLarge {
                max: MAX_DESCRIPTOR_SIZE,
            });
        }
        return Err(ProtocolError::ConnectionClosed);
    }
    Ok(serde_json::from_slice(&line)?)
}
