//! # rpcmux-server
//!
//! TCP server for rpcmux.
//!
//! This crate provides:
//! - Connection negotiation against an explicit codec registry
//! - Concurrent per-request dispatch with ordered response writes
//! - The [`Dispatcher`] seam for resolving service methods
//! - Layered YAML/environment configuration

pub mod config;
pub mod dispatch;
pub mod error;
pub mod server;

pub use config::{CodecsConfig, Config, ConfigError, NetworkConfig};
pub use dispatch::{DispatchError, Dispatcher, EchoDispatcher, MethodRouter};
pub use error::ServerError;
pub use server::{Server, ServerConfig, ServerStats};
