//! Session-aware HTTP exchanges
//!
//! [`SessionClient`] wraps a `reqwest::Client` and adds the two pieces of
//! MCP-over-HTTP plumbing the JSON-RPC layer should never see:
//!
//! 1. **Session continuity**: the first `Mcp-Session-Id` response header is
//!    remembered and attached to every later request.
//! 2. **Event-stream bodies**: `text/event-stream` responses are flattened to
//!    the concatenation of their `data:` payloads before being returned.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Session header name (`Mcp-Session-Id`; header names are case-insensitive)
pub const SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// Content type announcing an event-stream body
pub const EVENT_STREAM: &str = "text/event-stream";

/// Payload that marks the end of an event stream
const DONE_SENTINEL: &str = "[DONE]";

/// A response with its body already read and normalized
#[derive(Debug, Clone)]
pub struct SessionResponse {
    /// HTTP status
    pub status: StatusCode,

    /// `Content-Type` header, if any
    pub content_type: Option<String>,

    /// Effective body (event-stream framing removed)
    pub body: String,
}

/// HTTP client that carries an MCP session across exchanges
#[derive(Debug)]
pub struct SessionClient {
    http: reqwest::Client,
    timeout: Duration,
    session_id: RwLock<Option<String>>,
}

impl SessionClient {
    /// Build a client whose requests time out after `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::from_client(http, timeout))
    }

    /// Wrap an existing HTTP client.
    ///
    /// `timeout` should match the client's configured timeout; it is only
    /// used to report [`TransportError::Timeout`].
    pub fn from_client(http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            http,
            timeout,
            session_id: RwLock::new(None),
        }
    }

    /// The wrapped HTTP client, for building requests
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Current session id, if the server has assigned one
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Perform one exchange.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the HTTP timeout elapses and
    /// [`TransportError::Http`] for any other failure to complete the exchange.
    /// Error statuses are not errors at this layer.
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<SessionResponse> {
        if let Some(session_id) = self.session_id() {
            match HeaderValue::from_str(&session_id) {
                Ok(value) => {
                    request.headers_mut().insert(SESSION_HEADER, value);
                }
                Err(err) => warn!("Session id {:?} is not a valid header value: {}", session_id, err),
            }
        }

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|err| self.classify(err))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.remember_session(session_id);
        }

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let raw = response.text().await.map_err(|err| self.classify(err))?;

        let body = match &content_type {
            Some(content_type) if content_type.contains(EVENT_STREAM) => {
                debug!("Decoding event-stream response ({} bytes)", raw.len());
                decode_event_stream(&raw)
            }
            _ => raw,
        };

        Ok(SessionResponse {
            status,
            content_type,
            body,
        })
    }

    /// Store the first session id seen; later values never replace it
    fn remember_session(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let mut slot = self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match slot.as_deref() {
            None => {
                info!("Established MCP session: {}", session_id);
                *slot = Some(session_id.to_string());
            }
            Some(current) if current != session_id => {
                debug!(
                    "Ignoring session id {} (session {} already established)",
                    session_id, current
                );
            }
            Some(_) => {}
        }
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Http(err)
        }
    }
}

/// Flatten an event-stream body into the concatenation of its data payloads.
///
/// Each `data:` line contributes its trimmed payload; empty payloads and the
/// `[DONE]` sentinel are dropped. Payloads are concatenated as-is, not
/// wrapped in an array. A body without any `data:` line is returned
/// unchanged.
pub fn decode_event_stream(raw: &str) -> String {
    let mut payload = String::new();
    let mut saw_data = false;

    for line in raw.lines() {
        let Some(data) = line.trim().strip_prefix("data:") else {
            continue;
        };
        saw_data = true;

        let data = data.trim();
        if data.is_empty() || data == DONE_SENTINEL {
            continue;
        }
        payload.push_str(data);
    }

    if saw_data {
        payload
    } else {
        raw.to_string()
    }
}
