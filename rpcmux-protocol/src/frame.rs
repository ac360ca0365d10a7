//! Frame layout and framed stream halves.
//!
//! After negotiation each direction of a connection carries a sequence of
//! frames. A frame is a header segment followed by a body segment, both
//! serialized with the negotiated codec:
//!
//! ```text
//! +------------+----------------+------------+----------------+
//! | header_len | header         | body_len   | body           |
//! | 4 bytes BE | header_len     | 4 bytes BE | body_len bytes |
//! +------------+----------------+------------+----------------+
//! ```
//!
//! Length prefixes let a reader skip a body it has no destination for
//! without understanding its contents.

use crate::codec::CodecType;
use crate::error::ProtocolError;
use crate::MAX_SEGMENT_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Size of a segment length prefix.
pub const SEGMENT_PREFIX_SIZE: usize = 4;

/// Per-frame metadata preceding every body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target method in `Service.Method` form.
    pub service_method: String,
    /// Client-assigned sequence number correlating request and response.
    pub seq: u64,
    /// Error text set by the server; empty on success.
    pub error: String,
}

impl Header {
    /// Creates a request header with no error.
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Returns a copy of this header carrying an error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

fn segment_len(len: usize) -> Result<u32, ProtocolError> {
    if len > MAX_SEGMENT_SIZE as usize {
        return Err(ProtocolError::SegmentTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_SEGMENT_SIZE,
        });
    }
    Ok(len as u32)
}

/// Encodes a header and an already-serialized body into one contiguous frame.
pub fn encode_frame(
    codec: CodecType,
    header: &Header,
    body: &[u8],
) -> Result<BytesMut, ProtocolError> {
    let header_bytes = codec.encode(header)?;
    let header_len = segment_len(header_bytes.len())?;
    let body_len = segment_len(body.len())?;

    let mut buf =
        BytesMut::with_capacity(2 * SEGMENT_PREFIX_SIZE + header_bytes.len() + body.len());
    buf.put_u32(header_len);
    buf.put_slice(&header_bytes);
    buf.put_u32(body_len);
    buf.put_slice(body);
    Ok(buf)
}

/// An undecoded frame split into its two segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: Bytes,
    pub body: Bytes,
}

impl RawFrame {
    /// Decodes one frame from the front of a buffer.
    ///
    /// Returns `Ok(None)` and leaves the buffer untouched if it does not yet
    /// hold a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(header_len) = peek_len(buf, 0)? else {
            return Ok(None);
        };
        let body_prefix_at = SEGMENT_PREFIX_SIZE + header_len;
        let Some(body_len) = peek_len(buf, body_prefix_at)? else {
            return Ok(None);
        };
        let total = body_prefix_at + SEGMENT_PREFIX_SIZE + body_len;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(SEGMENT_PREFIX_SIZE);
        let header = buf.split_to(header_len).freeze();
        buf.advance(SEGMENT_PREFIX_SIZE);
        let body = buf.split_to(body_len).freeze();
        Ok(Some(Self { header, body }))
    }

    /// Deserializes the header segment.
    pub fn header(&self, codec: CodecType) -> Result<Header, ProtocolError> {
        codec.decode(&self.header)
    }

    /// Deserializes the body segment.
    pub fn body<T: DeserializeOwned>(&self, codec: CodecType) -> Result<T, ProtocolError> {
        codec.decode(&self.body)
    }
}

fn peek_len(buf: &[u8], at: usize) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < at + SEGMENT_PREFIX_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    if len > MAX_SEGMENT_SIZE {
        return Err(ProtocolError::SegmentTooLarge {
            size: len,
            max: MAX_SEGMENT_SIZE,
        });
    }
    Ok(Some(len as usize))
}

/// Read half of a negotiated connection.
///
/// Every method consumes whole segments, so the stream position always sits
/// on a segment boundary between calls.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    codec: CodecType,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: CodecType) -> Self {
        Self::from_buffered(BufReader::new(inner), codec)
    }

    /// Wraps a reader that has already been used to read the negotiation
    /// descriptor, keeping any frame bytes it buffered.
    pub fn from_buffered(inner: BufReader<R>, codec: CodecType) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Reads the next frame header.
    ///
    /// A clean end of stream before the first header byte is reported as
    /// [`ProtocolError::ConnectionClosed`].
    pub async fn read_header(&mut self) -> Result<Header, ProtocolError> {
        if self.inner.fill_buf().await?.is_empty() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let bytes = self.read_segment().await?;
        self.codec.decode(&bytes)
    }

    /// Reads the body segment without deserializing it.
    pub async fn read_body_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        self.read_segment().await
    }

    /// Reads and deserializes the body segment.
    ///
    /// The segment is consumed even when deserialization fails.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        let bytes = self.read_segment().await?;
        self.codec.decode(&bytes)
    }

    /// Skips over the body segment.
    pub async fn discard_body(&mut self) -> Result<(), ProtocolError> {
        self.read_segment().await.map(drop)
    }

    async fn read_segment(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.inner.read_u32().await?;
        if len > MAX_SEGMENT_SIZE {
            return Err(ProtocolError::SegmentTooLarge {
                size: len,
                max: MAX_SEGMENT_SIZE,
            });
        }
        let mut buf = BytesMut::zeroed(len as usize);
        self.inner.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

/// Write half of a negotiated connection.
///
/// Each write call emits one complete frame with a single `write_all` and
/// flushes before returning. Callers sharing a writer must still serialize
/// access to it (for example behind a mutex) so frames are not interleaved.
pub struct FrameWriter<W> {
    inner: W,
    codec: CodecType,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, codec: CodecType) -> Self {
        Self { inner, codec }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Serializes `body` and writes it with `header` as one frame.
    pub async fn write_frame<T: Serialize + ?Sized>(
        &mut self,
        header: &Header,
        body: &T,
    ) -> Result<(), ProtocolError> {
        let body = self.codec.encode(body)?;
        self.write_encoded(header, &body).await
    }

    /// Writes a frame whose body was serialized ahead of time.
    pub async fn write_encoded(
        &mut self,
        header: &Header,
        body: &[u8],
    ) -> Result<(), ProtocolError> {
        let frame = encode_frame(self.codec, header, body)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
