//! # rpcmux-protocol
//!
//! Wire protocol for rpcmux.
//!
//! This crate provides:
//! - The negotiation descriptor exchanged once per connection
//! - Frame headers and length-prefixed header/body framing
//! - Pluggable body codecs (bincode, JSON) selected through a [`CodecRegistry`]
//! - Async framed reader and writer halves

pub mod codec;
pub mod error;
pub mod frame;
pub mod negotiation;
pub mod registry;

pub use codec::{CodecType, BINCODE_TYPE, JSON_TYPE};
pub use error::ProtocolError;
pub use frame::{encode_frame, FrameReader, FrameWriter, Header, RawFrame};
pub use negotiation::{read_descriptor, write_descriptor, Descriptor};
pub use registry::CodecRegistry;

/// Magic number identifying an rpcmux connection.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Maximum size of a header or body segment (16 MiB).
pub const MAX_SEGMENT_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum length of the negotiation line, newline included.
pub const MAX_DESCRIPTOR_SIZE: usize = 4 * 1024;
