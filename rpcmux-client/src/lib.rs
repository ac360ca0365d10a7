//! # rpcmux-client
//!
//! Client library for rpcmux.
//!
//! This crate provides:
//! - Connection negotiation over any duplex byte stream, or TCP via [`Client::dial`]
//! - Multiplexing of concurrent calls over one connection, matched by sequence number
//! - Asynchronous calls with completion queues and awaitable synchronous calls
//! - Propagation of connection failure to every outstanding call

pub mod call;
pub mod client;
pub mod connection;
pub mod error;

pub use call::{completion_queue, Call, CompletionSender, Done, DEFAULT_COMPLETION_CAPACITY};
pub use client::Client;
pub use connection::{ClientConfig, DEFAULT_CONNECT_TIMEOUT};
pub use error::ClientError;
