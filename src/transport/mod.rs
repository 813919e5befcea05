//! MCP Transport Layer
//!
//! This module defines the transport abstraction used by the capability
//! client. Two transports implement it:
//!
//! - **stdio** ([`StdioTransport`]): newline-delimited JSON-RPC over a child
//!   process's pipes, or over streams supplied by the caller
//! - **HTTP** ([`HttpTransport`]): one POST per call, with session tracking
//!   and event-stream body decoding
//!
//! # Architecture
//!
//! The [`Transport`] trait is deliberately small: a call returning the raw
//! JSON result, the same call returning a JSON object, the session id, and
//! shutdown. Typed decoding lives in [`TransportExt::call`] so the trait
//! stays object safe and the client can own a `Box<dyn Transport>`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::CallContext;
use crate::error::{Result, TransportError};

pub mod http;
pub mod session;
pub mod stdio;

pub use http::{HttpConfig, HttpTransport};
pub use session::{decode_event_stream, SessionClient};
pub use stdio::{StdioConfig, StdioTransport, Unowned};

/// Transport contract for MCP communication
///
/// Implementations must be safe to share between tasks: concurrent calls on
/// one instance are allowed and complete independently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result.
    ///
    /// Resolves when the matching response arrives, the transport's request
    /// timeout elapses, or `ctx` ends, whichever comes first.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Remote`] when the server answers with an error object
    /// - [`TransportError::Timeout`] when no response arrives in time
    /// - [`TransportError::Cancelled`] / [`TransportError::DeadlineExceeded`] when `ctx` ends
    /// - [`TransportError::Closed`] when called after [`Transport::close`]
    async fn call_value(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value>;

    /// Same as [`Transport::call_value`], returning the result as an untyped
    /// JSON object. A `null` result yields an empty map.
    ///
    /// # Errors
    ///
    /// Everything [`Transport::call_value`] can return, plus
    /// [`TransportError::Decode`] when the result is not an object.
    async fn call_raw(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Map<String, Value>> {
        let result = self.call_value(ctx, method, params).await?;
        into_object(result)
    }

    /// Session identifier established with the server, if any
    fn session_id(&self) -> Option<String>;

    /// Release the transport's resources.
    ///
    /// Idempotent: only the first call has an effect, later calls return `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for or killing a spawned server fails.
    async fn close(&self) -> Result<()>;
}

/// Typed calls on top of any [`Transport`]
#[async_trait]
pub trait TransportExt: Transport {
    /// Send a request and decode its result into `R`.
    ///
    /// `R` must accept `null` if the method may return no result
    /// (`()`, `Option<_>` or [`Value`]).
    ///
    /// # Errors
    ///
    /// Everything [`Transport::call_value`] can return, plus
    /// [`TransportError::Decode`] when the result does not fit `R`.
    async fn call<R>(&self, ctx: &CallContext, method: &str, params: Option<Value>) -> Result<R>
    where
        R: DeserializeOwned + Send;
}

#[async_trait]
impl<T> TransportExt for T
where
    T: Transport + ?Sized,
{
    async fn call<R>(&self, ctx: &CallContext, method: &str, params: Option<Value>) -> Result<R>
    where
        R: DeserializeOwned + Send,
    {
        let result = self.call_value(ctx, method, params).await?;
        serde_json::from_value(result).map_err(TransportError::Decode)
    }
}

pub(crate) fn into_object(result: Value) -> Result<Map<String, Value>> {
    match result {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => serde_json::from_value(other).map_err(TransportError::Decode),
    }
}
