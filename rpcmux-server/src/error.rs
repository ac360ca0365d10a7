//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] rpcmux_protocol::ProtocolError),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ServerError {
    /// Returns whether the error ended a connection because the peer went away
    /// rather than because something was wrong.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ServerError::Protocol(rpcmux_protocol::ProtocolError::ConnectionClosed)
        )
    }
}
