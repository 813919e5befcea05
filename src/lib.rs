//! mcp-conduit
//!
//! Client-side plumbing for the Model Context Protocol: JSON-RPC 2.0
//! envelopes, a transport contract with subprocess (stdio) and streamable
//! HTTP implementations, and a capability client for tools, resources and
//! prompts.
//!
//! # Example
//!
//! ```ignore
//! use mcp_conduit::{CallContext, McpClient, StdioTransport, TransportExt};
//!
//! let transport = StdioTransport::spawn("my-mcp-server", &[])?;
//! let tools: serde_json::Value = transport
//!     .call(&CallContext::background(), "tools/list", None)
//!     .await?;
//!
//! let mut client = McpClient::new(transport);
//! client.initialize().await?;
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(test)]
mod proptests;

pub use client::{ClientConfig, ClientState, McpClient};
pub use context::CallContext;
pub use error::{Result, TransportError};
pub use protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcError};
pub use transport::{
    HttpConfig, HttpTransport, StdioConfig, StdioTransport, Transport, TransportExt, Unowned,
};
