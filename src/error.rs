//! Transport Error Types
//!
//! Every fallible transport and client operation returns [`TransportError`].

use std::time::Duration;

use crate::protocol::{codes, RpcError};

/// Errors surfaced by transports and the capability client
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a JSON-RPC error object
    #[error("remote error: {0}")]
    Remote(#[from] RpcError),

    /// The transport was shut down before or while the call was in flight
    #[error("transport is closed")]
    Closed,

    /// No response arrived within the transport's request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired first
    #[error("request cancelled")]
    Cancelled,

    /// The caller's deadline passed first
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The server process could not be started
    #[error("failed to spawn MCP server `{command}`: {source}")]
    Spawn {
        /// Command line that failed to start
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport construction was given unusable settings
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// Reading from or writing to the underlying streams failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound message could not be serialized
    #[error("failed to encode JSON-RPC message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A result could not be decoded into the requested shape
    #[error("failed to decode JSON-RPC result: {0}")]
    Decode(#[source] serde_json::Error),

    /// The peer sent something that is not a JSON-RPC response
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The HTTP exchange itself failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error status and no JSON-RPC body
    #[error("HTTP request failed with status {status}: {body}")]
    HttpStatus {
        /// HTTP status code
        status: u16,
        /// Response body, as received
        body: String,
    },
}

/// Result alias used throughout the crate
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

impl TransportError {
    /// The remote error object, if the server returned one
    pub fn remote(&self) -> Option<&RpcError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// JSON-RPC code associated with this error, where one exists
    pub fn rpc_code(&self) -> Option<i32> {
        match self {
            Self::Remote(err) => Some(err.code),
            Self::Closed => Some(codes::TRANSPORT_CLOSED),
            _ => None,
        }
    }

    /// Whether the call ended because the transport shut down
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the call ended because the transport's own timeout elapsed
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
