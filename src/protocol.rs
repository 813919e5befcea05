//! JSON-RPC 2.0 message types
//!
//! This module defines the envelopes exchanged with an MCP server. MCP is
//! built on top of JSON-RPC 2.0, a simple stateless RPC protocol.
//!
//! - JSON-RPC 2.0: <https://www.jsonrpc.org/specification>
//! - MCP: <https://modelcontextprotocol.io/specification/2025-06-18>
//!
//! Outbound messages are strongly typed ([`JsonRpcRequest`],
//! [`JsonRpcNotification`], [`JsonRpcResponse`]). Inbound messages are read
//! as generic JSON objects and sorted by [`InboundMessage::classify`], which
//! both transports share.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Generic error raised by a request handler
    pub const SERVER_ERROR: i32 = -32000;
    /// Synthetic error reported to calls still pending when a transport shuts down
    pub const TRANSPORT_CLOSED: i32 = -32000;
}

/// A JSON-RPC 2.0 request message
///
/// Each request carries a numeric identifier, unique per transport, used to
/// correlate the response.
///
/// ```json
/// {"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: u64,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new request
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 notification (a request without an `id`, never answered)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Notification method
    pub method: String,

    /// Notification parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new notification
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response message
///
/// A response carries either a `result` or an `error`, never both. The `id`
/// is kept as a raw JSON value so replies to server-initiated requests echo
/// the server's identifier verbatim, whatever its type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Identifier of the request being answered
    pub id: Value,

    /// Result payload (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn ok(id: impl Into<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn err(id: impl Into<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Check if the response is successful
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    /// Error code (JSON-RPC defined or server specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Create a new error
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create an error with additional data
    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Parse error (-32700)
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    /// Invalid request (-32600)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Invalid params (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    /// Internal error (-32603)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Handler failure (-32000)
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(codes::SERVER_ERROR, message)
    }

    /// Build an error from an inbound `error` member.
    ///
    /// Servers are not always strict about the shape of error objects, so
    /// this reads `code`, `message` and `data` individually and falls back to
    /// defaults instead of rejecting the whole response.
    pub fn from_value(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(|code| {
                code.as_i64()
                    .or_else(|| code.as_f64().map(|float| float as i64))
            })
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(codes::INTERNAL_ERROR);
        let message = match value.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ if value.is_string() => value.as_str().unwrap_or_default().to_string(),
            _ => String::new(),
        };
        Self {
            code,
            message,
            data: value.get("data").cloned(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Error {}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// An inbound message sorted by shape
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Carries an `id` and either `result` or `error`
    Response {
        /// Identifier of the request being answered
        id: Value,
        /// The result, or the structured remote error
        outcome: Result<Value, RpcError>,
    },

    /// Carries an `id` but neither `result` nor `error`: the server expects a reply
    Request {
        /// Identifier to echo in the reply
        id: Value,
        /// Requested method, if present
        method: Option<String>,
        /// Request parameters
        params: Option<Value>,
    },

    /// Carries no `id`: fire-and-forget
    Notification {
        /// Notification method, if present
        method: Option<String>,
        /// Notification parameters
        params: Option<Value>,
    },
}

impl InboundMessage {
    /// Sort a decoded JSON object into response, request or notification.
    ///
    /// An `error` member wins over `result` when a misbehaving peer sends both.
    pub fn classify(mut message: Map<String, Value>) -> Self {
        let method = match message.remove("method") {
            Some(Value::String(method)) => Some(method),
            _ => None,
        };
        let params = message.remove("params");

        let Some(id) = message.remove("id") else {
            return Self::Notification { method, params };
        };

        if let Some(error) = message.remove("error") {
            return Self::Response {
                id,
                outcome: Err(RpcError::from_value(&error)),
            };
        }
        if let Some(result) = message.remove("result") {
            return Self::Response {
                id,
                outcome: Ok(result),
            };
        }

        Self::Request { id, method, params }
    }
}
