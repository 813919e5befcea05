//! MCP HTTP Transport
//!
//! Each call is a single HTTP POST carrying one JSON-RPC request; the
//! response body carries the matching JSON-RPC response. Session tracking
//! and event-stream bodies are handled one layer down by [`SessionClient`],
//! so this module only deals with envelopes.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use mcp_conduit::transport::{HttpConfig, HttpTransport};
//!
//! let config = HttpConfig::new("https://mcp.example.com/mcp")
//!     .with_timeout(Duration::from_secs(60))
//!     .with_header("Authorization", "Bearer secret");
//! let transport = HttpTransport::with_config(config)?;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::session::{SessionClient, SessionResponse};
use super::Transport;
use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::protocol::{InboundMessage, JsonRpcRequest};

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `Accept` value announcing support for both plain and event-stream bodies
pub const ACCEPT_JSON_AND_EVENT_STREAM: &str = "application/json, text/event-stream";

/// Settings for an [`HttpTransport`]
///
/// # Configuration
///
/// - **url**: the MCP endpoint every request is posted to
/// - **timeout**: deadline for one whole HTTP exchange (default: 30 seconds)
/// - **headers**: added to every request; `Accept` defaults to
///   `application/json, text/event-stream`
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Endpoint URL
    pub url: String,

    /// Deadline for one HTTP exchange
    pub timeout: Duration,

    /// Headers sent with every request
    pub headers: BTreeMap<String, String>,
}

impl HttpConfig {
    /// Default settings for `url`
    pub fn new(url: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), ACCEPT_JSON_AND_EVENT_STREAM.to_string());
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            headers,
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set one header, replacing any existing header with the same name
    /// (names compare case-insensitively)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers
            .retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
        self
    }

    /// Set several headers at once
    pub fn with_headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        headers
            .into_iter()
            .fold(self, |config, (name, value)| config.with_header(name, value))
    }

    /// Explicitly accept event-stream bodies (already the default)
    pub fn with_sse_support(self) -> Self {
        self.with_header("Accept", ACCEPT_JSON_AND_EVENT_STREAM)
    }
}

/// HTTP transport for remote MCP servers
///
/// One underlying HTTP client is reused for every call. Concurrent calls on
/// one instance are independent exchanges.
#[derive(Debug)]
pub struct HttpTransport {
    config: HttpConfig,
    url: Url,
    headers: HeaderMap,
    session: SessionClient,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Create a transport for `url` with default settings
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] if the URL is not a valid
    /// `http`/`https` URL.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_config(HttpConfig::new(url))
    }

    /// Create a transport from explicit settings
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for an unusable URL or a
    /// header that is not valid HTTP, and [`TransportError::Http`] if the
    /// HTTP client cannot be built.
    pub fn with_config(config: HttpConfig) -> Result<Self> {
        let url = Url::parse(&config.url).map_err(|err| {
            TransportError::InvalidConfig(format!("invalid server URL {:?}: {}", config.url, err))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported URL scheme {:?} (expected http or https)",
                url.scheme()
            )));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                TransportError::InvalidConfig(format!("invalid header name {:?}: {}", name, err))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|err| {
                TransportError::InvalidConfig(format!("invalid value for header {}: {}", name, err))
            })?;
            headers.insert(header_name, header_value);
        }

        let session = SessionClient::new(config.timeout)?;

        info!("Created HTTP transport for {}", url);

        Ok(Self {
            config,
            url,
            headers,
            session,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Get the server URL
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Get the request timeout
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Settings this transport was built from
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Post one request and decode the matching response
    async fn exchange(&self, request: JsonRpcRequest) -> Result<Value> {
        let body = serde_json::to_vec(&request).map_err(TransportError::Encode)?;

        debug!("HTTP POST {} -> {} (id {})", self.url, request.method, request.id);

        let http_request = self
            .session
            .http()
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()?;

        let response = self.session.execute(http_request).await?;
        decode_response(request.id, response)
    }
}

/// JSON-RPC `params` must be structured: objects and arrays pass through,
/// scalars are wrapped in a one-element array, `null` is omitted
fn normalize_params(params: Option<Value>) -> Option<Value> {
    match params {
        None | Some(Value::Null) => None,
        Some(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        Some(scalar) => Some(Value::Array(vec![scalar])),
    }
}

fn decode_response(expected_id: u64, response: SessionResponse) -> Result<Value> {
    let SessionResponse { status, body, .. } = response;

    debug!("HTTP {} ({} bytes)", status, body.len());

    let failed_status = || TransportError::HttpStatus {
        status: status.as_u16(),
        body: body.clone(),
    };

    let document: Value = match serde_json::from_str(&body) {
        Ok(document) => document,
        Err(_) if !status.is_success() => return Err(failed_status()),
        Err(err) => return Err(TransportError::Decode(err)),
    };

    let Value::Object(message) = document else {
        if !status.is_success() {
            return Err(failed_status());
        }
        return Err(TransportError::InvalidResponse(format!(
            "expected a JSON-RPC response object, got: {}",
            body
        )));
    };

    match InboundMessage::classify(message) {
        InboundMessage::Response { id, outcome } => {
            if id.as_u64() != Some(expected_id) {
                warn!(
                    "HTTP response id {} does not match request id {}",
                    id, expected_id
                );
            }
            Ok(outcome?)
        }
        _ if !status.is_success() => Err(failed_status()),
        _ => Err(TransportError::InvalidResponse(
            "response carries neither result nor error".to_string(),
        )),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call_value(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        ctx.check()?;

        let request = JsonRpcRequest::new(self.next_request_id(), method, normalize_params(params));

        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            result = self.exchange(request) => result,
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    /// There is no connection or task to release; later calls fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed HTTP transport for {}", self.url);
        }
        Ok(())
    }
}
