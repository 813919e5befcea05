//! MCP Client Layer
//!
//! [`McpClient`] performs the `initialize` handshake over any [`Transport`]
//! and offers typed tool, resource and prompt operations on top of it.
//!
//! # Capability gating
//!
//! The handshake tells the client which features the server offers. An
//! operation on a feature the server never advertised is not attempted: list
//! operations return an empty list and single-item operations return
//! `Ok(None)`, without any traffic. Transport errors are surfaced unchanged.
//!
//! # Usage
//!
//! ```ignore
//! use mcp_conduit::client::McpClient;
//! use mcp_conduit::transport::StdioTransport;
//!
//! let transport = StdioTransport::spawn("npx", &["-y", "@modelcontextprotocol/server-filesystem", "/tmp"])?;
//! let mut client = McpClient::new(transport);
//!
//! client.initialize().await?;
//! for tool in client.list_tools().await? {
//!     println!("{}", tool.name);
//! }
//! client.close().await?;
//! ```

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::transport::{Transport, TransportExt};
use crate::types::{
    CallToolParams, CallToolResult, ClientCapabilities, CompleteRequest, CompleteResult,
    CompletionArgument, CompletionReference, GetPromptParams, GetPromptResult,
    Implementation, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Paginated, Prompt,
    ReadResourceResult, Resource, ResourceTemplate, ResourceUriParams, ServerCapabilities, Tool,
    LoggingLevel, SetLevelRequest, LATEST_PROTOCOL_VERSION,
};

/// Client identity and per-call settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name sent as `clientInfo.name`
    pub client_name: String,

    /// Version sent as `clientInfo.version`
    pub client_version: String,

    /// Protocol revision requested during the handshake
    pub protocol_version: String,

    /// Context every call derives from; cancelling it aborts all calls
    pub context: CallContext,

    /// Optional deadline applied to each call on top of the transport's own
    /// timeout
    pub call_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            context: CallContext::background(),
            call_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Name and version sent as `clientInfo` during the handshake
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    /// Protocol revision to request
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Parent context for every call the client makes
    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    /// Deadline applied to each call on top of the transport timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Client is created but not initialized
    Created,

    /// Handshake completed
    Ready,

    /// Transport has been closed
    Closed,
}

/// High-level MCP client
///
/// # Lifecycle
///
/// 1. Create client with `McpClient::new(transport)`
/// 2. Initialize with `client.initialize()`
/// 3. Use the client (list and call tools, read resources, get prompts)
/// 4. Close with `client.close()`
pub struct McpClient {
    transport: Box<dyn Transport>,
    config: ClientConfig,
    server: Option<InitializeResult>,
    state: ClientState,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("state", &self.state)
            .field("server", &self.server.as_ref().map(|s| &s.server_info))
            .finish()
    }
}

impl McpClient {
    /// Create a client with default settings
    pub fn new<T>(transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self::from_boxed(Box::new(transport), ClientConfig::default())
    }

    /// Create a client with explicit settings
    pub fn with_config<T>(transport: T, config: ClientConfig) -> Self
    where
        T: Transport + 'static,
    {
        Self::from_boxed(Box::new(transport), config)
    }

    /// Create a client over an already boxed transport
    pub fn from_boxed(transport: Box<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            server: None,
            state: ClientState::Created,
        }
    }

    /// Perform the `initialize` handshake and remember the server's answer.
    ///
    /// Only the first successful call contacts the server; later calls return
    /// the cached result.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`McpClient::close`], and any
    /// transport or decode error from the handshake itself.
    pub async fn initialize(&mut self) -> Result<&InitializeResult> {
        self.ensure_open()?;

        if self.server.is_none() {
            info!("Initializing MCP connection...");

            let params = InitializeParams {
                protocol_version: self.config.protocol_version.clone(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation::new(
                    self.config.client_name.clone(),
                    self.config.client_version.clone(),
                ),
            };
            let params = serde_json::to_value(params).map_err(TransportError::Encode)?;

            let result: InitializeResult = self
                .transport
                .call(&self.call_context(), "initialize", Some(params))
                .await?;

            if result.protocol_version != self.config.protocol_version {
                warn!(
                    "Server answered with protocol {} (requested {})",
                    result.protocol_version, self.config.protocol_version
                );
            }
            info!(
                "MCP connection initialized: {} v{} (protocol {})",
                result.server_info.name, result.server_info.version, result.protocol_version
            );

            self.server = Some(result);
            self.state = ClientState::Ready;
        }

        self.server
            .as_ref()
            .ok_or_else(|| TransportError::InvalidResponse("initialize result missing".to_string()))
    }

    /// Get the current client state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Full handshake result, once initialized
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Server name and version from the handshake
    pub fn server_info(&self) -> Option<&Implementation> {
        self.server.as_ref().map(|server| &server.server_info)
    }

    /// Capabilities the server advertised
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.server.as_ref().map(|server| &server.capabilities)
    }

    /// Usage hints the server supplied during the handshake
    pub fn instructions(&self) -> Option<&str> {
        self.server
            .as_ref()
            .and_then(|server| server.instructions.as_deref())
    }

    /// Session identifier held by the transport, if any
    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    /// The underlying transport
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Whether the server advertised tools
    pub fn has_tools(&self) -> bool {
        self.capabilities().is_some_and(|caps| caps.tools.is_some())
    }

    /// Whether the server advertised resources
    pub fn has_resources(&self) -> bool {
        self.capabilities()
            .is_some_and(|caps| caps.resources.is_some())
    }

    /// Whether the server advertised prompts
    pub fn has_prompts(&self) -> bool {
        self.capabilities().is_some_and(|caps| caps.prompts.is_some())
    }

    /// Whether `resources/subscribe` is available
    pub fn supports_resource_subscriptions(&self) -> bool {
        self.capabilities()
            .and_then(|caps| caps.resources.as_ref())
            .is_some_and(|resources| resources.subscribe)
    }

    /// Liveness check; not gated on any capability
    pub async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        let _: Value = self
            .transport
            .call(&self.call_context(), "ping", None)
            .await?;
        Ok(())
    }

    /// One page of `tools/list`
    pub async fn list_tools_page(&self, cursor: Option<&str>) -> Result<ListToolsResult> {
        self.ensure_open()?;
        if !self.has_tools() {
            return Ok(ListToolsResult::default());
        }
        self.fetch_page("tools/list", cursor).await
    }

    /// Every tool, following `nextCursor` until the last page
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.ensure_open()?;
        if !self.has_tools() {
            return Ok(Vec::new());
        }
        let tools = self.fetch_all::<ListToolsResult>("tools/list").await?;
        info!("Listed {} tools from MCP server", tools.len());
        for tool in &tools {
            debug!("  - {}", tool.name);
        }
        Ok(tools)
    }

    /// Invoke a tool.
    ///
    /// A tool that ran and failed is reported through
    /// [`CallToolResult::is_error`], not as an `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<Option<CallToolResult>> {
        self.ensure_open()?;
        if !self.has_tools() {
            return Ok(None);
        }

        debug!("Calling tool: {} with arguments: {:?}", name, arguments);

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
            meta: None,
        };
        let params = serde_json::to_value(params).map_err(TransportError::Encode)?;
        let result: CallToolResult = self
            .transport
            .call(&self.call_context(), "tools/call", Some(params))
            .await?;

        if result.is_error {
            debug!("Tool '{}' reported an error", name);
        }
        Ok(Some(result))
    }

    /// One page of `resources/list`
    pub async fn list_resources_page(&self, cursor: Option<&str>) -> Result<ListResourcesResult> {
        self.ensure_open()?;
        if !self.has_resources() {
            return Ok(ListResourcesResult::default());
        }
        self.fetch_page("resources/list", cursor).await
    }

    /// Every resource, following `nextCursor` until the last page
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        self.ensure_open()?;
        if !self.has_resources() {
            return Ok(Vec::new());
        }
        self.fetch_all::<ListResourcesResult>("resources/list").await
    }

    /// One page of `resources/templates/list`
    pub async fn list_resource_templates_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourceTemplatesResult> {
        self.ensure_open()?;
        if !self.has_resources() {
            return Ok(ListResourceTemplatesResult::default());
        }
        self.fetch_page("resources/templates/list", cursor).await
    }

    /// Every resource template, following `nextCursor` until the last page
    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        self.ensure_open()?;
        if !self.has_resources() {
            return Ok(Vec::new());
        }
        self.fetch_all::<ListResourceTemplatesResult>("resources/templates/list")
            .await
    }

    /// Contents of one resource; `None` without the resources capability
    pub async fn read_resource(&self, uri: &str) -> Result<Option<ReadResourceResult>> {
        self.ensure_open()?;
        if !self.has_resources() {
            return Ok(None);
        }
        let result = self
            .transport
            .call(&self.call_context(), "resources/read", Some(uri_params(uri)?))
            .await?;
        Ok(Some(result))
    }

    /// Ask for `notifications/resources/updated` about `uri`.
    ///
    /// Returns `false` without contacting the server when it does not
    /// support subscriptions.
    pub async fn subscribe_resource(&self, uri: &str) -> Result<bool> {
        self.resource_subscription("resources/subscribe", uri).await
    }

    /// Cancel a subscription made with [`McpClient::subscribe_resource`]
    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<bool> {
        self.resource_subscription("resources/unsubscribe", uri).await
    }

    /// One page of `prompts/list`
    pub async fn list_prompts_page(&self, cursor: Option<&str>) -> Result<ListPromptsResult> {
        self.ensure_open()?;
        if !self.has_prompts() {
            return Ok(ListPromptsResult::default());
        }
        self.fetch_page("prompts/list", cursor).await
    }

    /// Every prompt, following `nextCursor` until the last page
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        self.ensure_open()?;
        if !self.has_prompts() {
            return Ok(Vec::new());
        }
        self.fetch_all::<ListPromptsResult>("prompts/list").await
    }

    /// Render a prompt; `None` without the prompts capability
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<BTreeMap<String, String>>,
    ) -> Result<Option<GetPromptResult>> {
        self.ensure_open()?;
        if !self.has_prompts() {
            return Ok(None);
        }
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        let params = serde_json::to_value(params).map_err(TransportError::Encode)?;
        let result = self
            .transport
            .call(&self.call_context(), "prompts/get", Some(params))
            .await?;
        Ok(Some(result))
    }

    /// Ask the server to send log messages at `level` and above.
    ///
    /// Returns `false` without traffic when the server has no logging
    /// capability.
    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<bool> {
        self.ensure_open()?;
        if !self.capabilities().is_some_and(|caps| caps.logging.is_some()) {
            return Ok(false);
        }
        let params = serde_json::to_value(SetLevelRequest { level }).map_err(TransportError::Encode)?;
        let _: Value = self
            .transport
            .call(&self.call_context(), "logging/setLevel", Some(params))
            .await?;
        Ok(true)
    }

    /// Completion candidates for one argument of a prompt or resource template
    pub async fn complete(
        &self,
        reference: CompletionReference,
        name: &str,
        value: &str,
    ) -> Result<Option<CompleteResult>> {
        self.ensure_open()?;
        if !self.capabilities().is_some_and(|caps| caps.completions.is_some()) {
            return Ok(None);
        }
        let request = CompleteRequest {
            reference,
            argument: CompletionArgument {
                name: name.to_string(),
                value: value.to_string(),
            },
            context: None,
        };
        let params = serde_json::to_value(request).map_err(TransportError::Encode)?;
        let result = self
            .transport
            .call(&self.call_context(), "completion/complete", Some(params))
            .await?;
        Ok(Some(result))
    }

    /// Close the transport. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ClientState::Closed {
            return Ok(());
        }
        self.state = ClientState::Closed;
        self.transport.close().await
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ClientState::Closed => Err(TransportError::Closed),
            ClientState::Created | ClientState::Ready => Ok(()),
        }
    }

    fn call_context(&self) -> CallContext {
        match self.config.call_timeout {
            Some(timeout) => self.config.context.child().with_timeout(timeout),
            None => self.config.context.clone(),
        }
    }

    async fn resource_subscription(&self, method: &str, uri: &str) -> Result<bool> {
        self.ensure_open()?;
        if !self.supports_resource_subscriptions() {
            return Ok(false);
        }
        let _: Value = self
            .transport
            .call(&self.call_context(), method, Some(uri_params(uri)?))
            .await?;
        Ok(true)
    }

    async fn fetch_page<P>(&self, method: &str, cursor: Option<&str>) -> Result<P>
    where
        P: DeserializeOwned + Send,
    {
        let params = cursor.map(|cursor| json!({ "cursor": cursor }));
        self.transport
            .call(&self.call_context(), method, params)
            .await
    }

    async fn fetch_all<P>(&self, method: &str) -> Result<Vec<P::Item>>
    where
        P: Paginated + DeserializeOwned + Send,
    {
        let mut items = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let page: P = self.fetch_page(method, cursor.as_deref()).await?;
            let next = page
                .next_cursor()
                .filter(|next| !next.is_empty())
                .map(str::to_owned);
            items.extend(page.into_items());

            match next {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!("{} repeated cursor {:?}; stopping pagination", method, next);
                    break;
                }
                None => break,
            }
        }

        Ok(items)
    }
}

fn uri_params(uri: &str) -> Result<Value> {
    serde_json::to_value(ResourceUriParams {
        uri: uri.to_string(),
    })
    .map_err(TransportError::Encode)
}
