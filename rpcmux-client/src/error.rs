//! Client error types.

use rpcmux_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client was closed, or the connection was torn down, before the
    /// call could be sent or answered.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection failed while the call was outstanding. Every call
    /// pending at that moment shares the same underlying error.
    #[error("connection lost: {0}")]
    ConnectionLost(Arc<ProtocolError>),

    /// Error text reported by the server, verbatim.
    #[error("{0}")]
    Server(String),

    #[error("request timeout")]
    Timeout,
}

impl ClientError {
    /// Returns whether the error leaves the client unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Shutdown | ClientError::ConnectionLost(_)
        )
    }

    /// Returns whether this error is retryable on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionLost(_) => true,
            _ => false,
        }
    }
}
