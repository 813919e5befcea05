//! MCP stdio Transport
//!
//! Runs a JSON-RPC peer as a child process (or over streams supplied by the
//! caller) and multiplexes concurrent calls over one pair of byte streams.
//! Each message is one JSON document followed by `\n`.
//!
//! # Architecture
//!
//! Three background tasks live as long as the transport:
//!
//! - the **writer** owns the peer's input and writes complete lines queued
//!   by callers, so a call that is dropped or times out never leaves half a
//!   message on the stream
//! - the **reader** scans the peer's output line by line, delivers responses
//!   to waiting calls by id, answers server-initiated requests and forwards
//!   notifications to the registered handler
//! - the **stderr drain** forwards the child's diagnostics to `tracing`
//!
//! Every call registers a `oneshot` slot under a fresh id *before* its
//! request is written, so a fast reply can never arrive unclaimed. The slot
//! is removed on every exit path, including when the call future is dropped.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Transport;
use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::protocol::{InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcError};

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for each background task to stop
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `close` lets a spawned server exit on its own before killing it
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback for notifications sent by the server
pub type NotificationHandler = Arc<dyn Fn(&str, Option<Value>) + Send + Sync>;

/// Callback for requests sent by the server; `Err` is answered with code -32000
pub type RequestHandler = Arc<dyn Fn(&str, Option<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Settings for spawning an MCP server
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Executable to run
    pub command: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Working directory for the child (inherited when unset)
    pub working_dir: Option<PathBuf>,

    /// Complete environment for the child; replaces the inherited one when set
    pub env: Option<BTreeMap<String, String>>,

    /// Fallback timeout for each call
    pub timeout: Duration,
}

impl StdioConfig {
    /// Settings for running `command` with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the child's working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace the child's environment with `env`
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            env.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    /// Add one variable to the child's (replaced) environment
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the per-call fallback timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Stream wrapper for handles the transport does not own.
///
/// Reads and writes are forwarded unchanged; shutting the wrapper down only
/// flushes, so closing the transport leaves the wrapped stream open.
#[derive(Debug)]
pub struct Unowned<T>(pub T);

impl<T: AsyncRead + Unpin> AsyncRead for Unowned<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Unowned<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.0.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }
}

#[derive(Default)]
struct Handlers {
    notification: Option<NotificationHandler>,
    request: Option<RequestHandler>,
}

/// State shared between callers and the background tasks
struct Shared {
    /// Queue feeding the writer task; `None` once closed
    outbound: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,

    /// Calls waiting for a response, by request id
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,

    handlers: RwLock<Handlers>,

    /// Set by `close`
    closed: AtomicBool,

    /// Set (under the `pending` lock) once no response can arrive anymore
    disconnected: AtomicBool,

    label: String,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a pending slot when the call ends, however it ends
struct PendingEntry<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

impl Shared {
    fn new(outbound: mpsc::UnboundedSender<Vec<u8>>, label: String) -> Self {
        Self {
            outbound: StdMutex::new(Some(outbound)),
            pending: StdMutex::new(HashMap::new()),
            handlers: RwLock::new(Handlers::default()),
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            label,
        }
    }

    fn register(&self, id: u64) -> Result<(PendingEntry<'_>, oneshot::Receiver<Result<Value>>)> {
        let mut pending = lock(&self.pending);
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok((PendingEntry { shared: self, id }, rx))
    }

    /// Resolve every waiting call with `Closed` and refuse new ones
    fn fail_pending(&self) {
        let mut pending = lock(&self.pending);
        self.disconnected.store(true, Ordering::Release);
        if !pending.is_empty() {
            debug!(
                "Failing {} pending call(s) to {}: transport closed",
                pending.len(),
                self.label
            );
        }
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    /// Queue one message for the writer task. Never waits on the peer.
    fn enqueue<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_vec(message).map_err(TransportError::Encode)?;
        debug!("-> {}: {}", self.label, String::from_utf8_lossy(&line));
        line.push(b'\n');

        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.send(line).map_err(|_| TransportError::Closed)
    }

    fn dispatch_line(&self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            warn!("Skipping non UTF-8 line from {}", self.label);
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        debug!("<- {}: {}", self.label, text);

        let message: Map<String, Value> = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!("Skipping malformed message from {}: {}: {}", self.label, err, text);
                return;
            }
        };

        match InboundMessage::classify(message) {
            InboundMessage::Response { id, outcome } => {
                self.deliver(&id, outcome.map_err(TransportError::Remote));
            }
            InboundMessage::Request { id, method, params } => {
                self.answer(id, method, params);
            }
            InboundMessage::Notification { method, params } => {
                self.notify_handler(method, params);
            }
        }
    }

    fn deliver(&self, id: &Value, outcome: Result<Value>) {
        let Some(request_id) = numeric_id(id) else {
            warn!("Dropping response from {} with unusable id {}", self.label, id);
            return;
        };

        let sender = lock(&self.pending).remove(&request_id);
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("Caller for request {} is gone", request_id);
                }
            }
            None => debug!(
                "Dropping response {} from {}: no pending call (late or unknown)",
                request_id, self.label
            ),
        }
    }

    fn answer(&self, id: Value, method: Option<String>, params: Option<Value>) {
        let response = match method {
            None => JsonRpcResponse::err(id, RpcError::invalid_request("Invalid request: missing method")),
            Some(method) => {
                let handler = self
                    .handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .request
                    .clone();
                match handler {
                    Some(handler) => match handler(&method, params) {
                        Ok(result) => JsonRpcResponse::ok(id, result),
                        Err(err) => JsonRpcResponse::err(id, RpcError::server_error(err.to_string())),
                    },
                    None => {
                        debug!("No request handler for {} from {}", method, self.label);
                        JsonRpcResponse::err(id, RpcError::method_not_found(&method))
                    }
                }
            }
        };

        if let Err(err) = self.enqueue(&response) {
            warn!("Failed to answer request from {}: {}", self.label, err);
        }
    }

    fn notify_handler(&self, method: Option<String>, params: Option<Value>) {
        let Some(method) = method else {
            debug!("Dropping notification without method from {}", self.label);
            return;
        };
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notification
            .clone();
        if let Some(handler) = handler {
            handler(&method, params);
        }
    }
}

/// Response ids are integers we issued; tolerate peers that echo them as
/// floats or strings
fn numeric_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && *float >= 0.0)
                .map(|float| float as u64)
        }),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

async fn read_messages<R>(shared: Arc<Shared>, reader: R, shutdown: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(4096);

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => {
                info!("MCP server {} closed its output", shared.label);
                break;
            }
            Ok(_) => shared.dispatch_line(&line),
            Err(err) => {
                warn!("Failed to read from MCP server {}: {}", shared.label, err);
                break;
            }
        }
    }

    shared.fail_pending();
}

async fn write_messages(
    shared: Arc<Shared>,
    mut sink: BoxedWrite,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            line = outbound.recv() => line,
        };
        // Queue closed by `close`: everything before it has been written
        let Some(line) = line else { break };

        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            written = write_line(&mut sink, &line) => written,
        };
        if let Err(err) = written {
            warn!("Failed to write to MCP server {}: {}", shared.label, err);
            shared.fail_pending();
            return;
        }
    }

    if let Err(err) = sink.shutdown().await {
        debug!("Failed to shut down input of {}: {}", shared.label, err);
    }
}

async fn write_line(sink: &mut BoxedWrite, line: &[u8]) -> io::Result<()> {
    sink.write_all(line).await?;
    sink.flush().await
}

async fn drain_stderr<E>(label: String, stderr: E, shutdown: CancellationToken)
where
    E: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = reader.read_until(b'\n', &mut line) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    info!(target: "mcp_conduit::stdio", server = %label, "{}", text);
                }
            }
            Err(err) => {
                debug!("Stopped reading stderr of {}: {}", label, err);
                break;
            }
        }
    }
}

/// stdio transport for local MCP servers
///
/// # Example
///
/// ```ignore
/// let transport = StdioTransport::spawn(
///     "npx",
///     &["-y", "@modelcontextprotocol/server-filesystem", "/path/to/files"],
/// )?;
/// let tools = transport.call_raw(&CallContext::background(), "tools/list", None).await?;
/// ```
///
/// Constructors start background tasks and must be called from within a
/// Tokio runtime.
pub struct StdioTransport {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    timeout: Duration,
    shutdown: CancellationToken,
    writer: StdMutex<Option<JoinHandle<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Spawn a new MCP server process with default settings
    ///
    /// # Errors
    ///
    /// See [`StdioTransport::with_config`].
    pub fn spawn(command: &str, args: &[&str]) -> Result<Self> {
        Self::with_config(StdioConfig::new(command).with_args(args.iter().copied()))
    }

    /// Spawn a new MCP server process
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidConfig`] for an empty command and
    /// [`TransportError::Spawn`] if the process cannot be started. No
    /// transport is returned in either case.
    pub fn with_config(config: StdioConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "command is required for stdio transport".to_string(),
            ));
        }

        let label = config.display();
        info!("Spawning MCP server: {}", label);
        debug!("Working directory: {:?}, environment replaced: {}", config.working_dir, config.env.is_some());

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        if let Some(env) = &config.env {
            command.env_clear().envs(env);
        }

        let spawn_error = |source: io::Error| TransportError::Spawn {
            command: label.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_error)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("child stdin was not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(io::Error::other("child stdout was not captured")))?;
        let stderr = child.stderr.take();

        if let Some(pid) = child.id() {
            debug!("MCP server {} running as pid {}", label, pid);
        }

        Ok(Self::start(
            Box::new(stdin),
            stdout,
            stderr,
            Some(child),
            label,
            config.timeout,
        ))
    }

    /// Adopt existing streams: `writer` carries requests to the peer and
    /// `reader` carries its messages back. No process is managed.
    pub fn from_streams<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::start(
            Box::new(writer),
            reader,
            None::<tokio::io::Empty>,
            None,
            "streams".to_string(),
            DEFAULT_TIMEOUT,
        )
    }

    /// Like [`StdioTransport::from_streams`], also draining a diagnostic stream
    pub fn from_streams_with_stderr<W, R, E>(writer: W, reader: R, stderr: E) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self::start(
            Box::new(writer),
            reader,
            Some(stderr),
            None,
            "streams".to_string(),
            DEFAULT_TIMEOUT,
        )
    }

    /// Speak JSON-RPC over this process's own stdin/stdout.
    ///
    /// The host streams are wrapped in [`Unowned`] so closing the transport
    /// never closes them.
    pub fn from_process_stdio() -> Self {
        Self::start(
            Box::new(Unowned(tokio::io::stdout())),
            Unowned(tokio::io::stdin()),
            None::<tokio::io::Empty>,
            None,
            "process stdio".to_string(),
            DEFAULT_TIMEOUT,
        )
    }

    /// Set the per-call fallback timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn start<R, E>(
        writer: BoxedWrite,
        reader: R,
        stderr: Option<E>,
        child: Option<Child>,
        label: String,
        timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let (outbound, queued) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(outbound, label.clone()));
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(write_messages(
            shared.clone(),
            writer,
            queued,
            shutdown.clone(),
        ));
        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(read_messages(
            shared.clone(),
            reader,
            shutdown.clone(),
        )));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(label, stderr, shutdown.clone())));
        }

        Self {
            shared,
            next_id: AtomicU64::new(1),
            timeout,
            shutdown,
            writer: StdMutex::new(Some(writer)),
            tasks: StdMutex::new(tasks),
            child: Mutex::new(child),
        }
    }

    /// Server command line (or stream description), for diagnostics
    pub fn command(&self) -> &str {
        &self.shared.label
    }

    /// Per-call fallback timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of calls currently waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Send a notification (no id, no response)
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after `close` or once the peer's
    /// input can no longer be written.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.shared.enqueue(&JsonRpcNotification::new(method, params))
    }

    /// Register the notification callback, replacing any previous one.
    ///
    /// Called on the reader task; it should return quickly.
    pub fn set_notification_handler<F>(&self, handler: F)
    where
        F: Fn(&str, Option<Value>) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .notification = Some(Arc::new(handler));
    }

    /// Register the server-request callback, replacing any previous one.
    ///
    /// Called on the reader task; it should return quickly.
    pub fn set_request_handler<F>(&self, handler: F)
    where
        F: Fn(&str, Option<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .request = Some(Arc::new(handler));
    }

    async fn stop_child(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!("MCP server {} exited: {}", self.shared.label, status);
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                warn!(
                    "MCP server {} did not exit within {:?}, killing it",
                    self.shared.label, CHILD_EXIT_GRACE
                );
                child.kill().await?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.shared.label)
            .field("timeout", &self.timeout)
            .field("pending", &self.pending_count())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Stops the background tasks; a spawned child is killed on drop.
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn call_value(
        &self,
        ctx: &CallContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        ctx.check()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_entry, response) = self.shared.register(id)?;

        self.shared.enqueue(&JsonRpcRequest::new(id, method, params))?;

        tokio::select! {
            biased;
            outcome = response => outcome.unwrap_or_else(|_| Err(TransportError::Closed)),
            err = ctx.done() => Err(err),
            _ = tokio::time::sleep(self.timeout) => {
                warn!("Request {} ({}) to {} timed out after {:?}", id, method, self.shared.label, self.timeout);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing stdio transport for {}", self.shared.label);

        self.shared.fail_pending();

        // Dropping the sender lets the writer flush what is queued and shut
        // the peer's input down
        drop(lock(&self.shared.outbound).take());
        let writer = lock(&self.writer).take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut writer).await.is_err() {
                warn!("Input stream of {} is blocked; dropping queued messages", self.shared.label);
                self.shutdown.cancel();
                let _ = tokio::time::timeout(TASK_JOIN_TIMEOUT, writer).await;
            }
        }

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("Background task for {} did not stop within {:?}", self.shared.label, TASK_JOIN_TIMEOUT);
            }
        }

        self.stop_child().await
    }
}


#[cfg(test)]
mod tests {
    use super::peer::{pair, pair_with_capacity};
    use super::*;
    use crate::types::{ListRootsResult, Root};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_call_round_trip() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let server = async {
            let request = peer.recv().await;
            assert_eq!(request["jsonrpc"], "2.0");
            assert_eq!(request["method"], "tools/list");
            assert_eq!(request["params"], json!({"cursor": "c1"}));
            peer.reply(&request["id"], json!({"tools": []})).await;
        };

        let (result, ()) = tokio::join!(
            transport.call_value(&ctx, "tools/list", Some(json!({"cursor": "c1"}))),
            server
        );

        assert_eq!(result.unwrap(), json!({"tools": []}));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_responses_correlate_by_id_not_order() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let server = async {
            let a = peer.recv().await;
            let b = peer.recv().await;
            peer.reply(&b["id"], json!({"method": b["method"]})).await;
            peer.reply(&a["id"], json!({"method": a["method"]})).await;
        };

        let (first, second, ()) = tokio::join!(
            transport.call_value(&ctx, "first", None),
            transport.call_value(&ctx, "second", None),
            server
        );

        assert_eq!(first.unwrap(), json!({"method": "first"}));
        assert_eq!(second.unwrap(), json!({"method": "second"}));
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let server = async {
            let a = peer.recv().await;
            peer.reply(&a["id"], Value::Null).await;
            let b = peer.recv().await;
            peer.reply(&b["id"], Value::Null).await;
            (a["id"].as_u64().unwrap(), b["id"].as_u64().unwrap())
        };
        let client = async {
            transport.call_value(&ctx, "ping", None).await.unwrap();
            transport.call_value(&ctx, "ping", None).await.unwrap();
        };

        let ((a, b), ()) = tokio::join!(server, client);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_remote_error_is_structured() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let server = async {
            let request = peer.recv().await;
            peer.send(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32602, "message": "Unknown tool", "data": {"name": "nope"}}
            }))
            .await;
        };

        let (result, ()) = tokio::join!(transport.call_value(&ctx, "tools/call", None), server);

        let err = result.unwrap_err();
        let remote = err.remote().expect("remote error");
        assert_eq!(remote.code, -32602);
        assert_eq!(remote.message, "Unknown tool");
        assert_eq!(remote.data, Some(json!({"name": "nope"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_pending_entry() {
        let (transport, mut peer) = pair();
        let transport = transport.with_request_timeout(Duration::from_secs(30));
        let ctx = CallContext::background();

        let (result, _) = tokio::join!(transport.call_value(&ctx, "slow", None), peer.recv());

        assert!(matches!(result, Err(TransportError::Timeout(d)) if d == Duration::from_secs(30)));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_dropped() {
        let (transport, mut peer) = pair();
        let transport = transport.with_request_timeout(Duration::from_secs(1));
        let ctx = CallContext::background();

        let (result, late) = tokio::join!(transport.call_value(&ctx, "slow", None), peer.recv());
        assert!(result.unwrap_err().is_timeout());

        peer.reply(&late["id"], json!("too late")).await;

        let server = async {
            let request = peer.recv().await;
            peer.reply(&request["id"], json!("on time")).await;
        };
        let (result, ()) = tokio::join!(transport.call_value(&ctx, "fast", None), server);
        assert_eq!(result.unwrap(), json!("on time"));
    }

    #[tokio::test]
    async fn test_cancellation_releases_pending_entry() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let canceller = async {
            peer.recv().await;
            ctx.cancel();
        };
        let (result, ()) = tokio::join!(transport.call_value(&ctx, "slow", None), canceller);

        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_distinct_from_timeout() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background().with_timeout(Duration::from_secs(2));

        let (result, _) = tokio::join!(transport.call_value(&ctx, "slow", None), peer.recv());

        assert!(matches!(result, Err(TransportError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_dropped_call_future_releases_pending_entry() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        {
            let call = transport.call_value(&ctx, "slow", None);
            tokio::pin!(call);
            tokio::select! {
                _ = &mut call => panic!("call should not complete"),
                _ = peer.recv() => {}
            }
            assert_eq!(transport.pending_count(), 1);
        }

        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_is_bounded_when_peer_stops_reading() {
        let (transport, _peer) = pair_with_capacity(64);
        let transport = transport.with_request_timeout(Duration::from_millis(200));
        let ctx = CallContext::background().with_timeout(Duration::from_millis(100));
        let blob = "x".repeat(4096);

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            transport.call_value(&ctx, "big", Some(json!({"blob": blob}))),
        )
        .await
        .expect("call outlived its deadline");

        assert!(matches!(result, Err(TransportError::DeadlineExceeded)), "got {:?}", result);
        assert_eq!(transport.pending_count(), 0);

        // The stuck write must not block close either
        tokio::time::timeout(Duration::from_secs(3), transport.close())
            .await
            .expect("close blocked on a full pipe")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_call_leaves_line_framing_intact() {
        let (transport, mut peer) = pair_with_capacity(64);
        let ctx = CallContext::background();
        let blob = "x".repeat(4096);

        // The peer is not reading yet, so this call is dropped mid-write
        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            transport.call_value(&ctx, "big", Some(json!({"blob": blob}))),
        )
        .await;
        assert!(dropped.is_err());

        let server = async {
            let big = peer.recv().await;
            assert_eq!(big["method"], "big");
            assert_eq!(big["params"]["blob"].as_str().map(str::len), Some(4096));

            let ping = peer.recv().await;
            assert_eq!(ping["method"], "ping");
            peer.reply(&ping["id"], json!({})).await;
        };
        let (result, ()) = tokio::join!(transport.call_value(&ctx, "ping", None), server);

        assert_eq!(result.unwrap(), json!({}));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_request_answered_while_call_is_blocked() {
        let (transport, mut peer) = pair_with_capacity(64);
        let transport = transport.with_request_timeout(Duration::from_millis(200));
        let ctx = CallContext::background();
        let blob = "x".repeat(4096);
        transport.set_request_handler(|_, _| {
            let roots = ListRootsResult {
                roots: vec![Root::new("file:///tmp")],
                meta: None,
            };
            Ok(serde_json::to_value(roots)?)
        });

        let stalled = async {
            let result = transport
                .call_value(&ctx, "big", Some(json!({"blob": blob})))
                .await;
            assert!(result.unwrap_err().is_timeout());
        };
        let server = async {
            peer.send(json!({"jsonrpc": "2.0", "id": 7, "method": "roots/list"})).await;
            tokio::time::sleep(Duration::from_millis(300)).await;

            // Queued behind the stalled request, then delivered intact
            assert_eq!(peer.recv().await["method"], "big");
            let reply = peer.recv().await;
            assert_eq!(reply["id"], 7);
            assert_eq!(reply["result"], json!({"roots": [{"uri": "file:///tmp"}]}));
        };
        tokio::join!(stalled, server);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let closer = async {
            peer.recv().await;
            peer.recv().await;
            transport.close().await.unwrap();
        };
        let (a, b, ()) = tokio::join!(
            transport.call_value(&ctx, "one", None),
            transport.call_value(&ctx, "two", None),
            closer
        );

        assert!(a.unwrap_err().is_closed());
        assert!(b.unwrap_err().is_closed());
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, _peer) = pair();

        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport
            .call_value(&CallContext::background(), "ping", None)
            .await
            .unwrap_err();
        assert!(err.is_closed());
        assert!(transport.notify("x", None).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_calls() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let hangup = async move {
            peer.recv().await;
            drop(peer);
        };
        let (result, ()) = tokio::join!(transport.call_value(&ctx, "one", None), hangup);
        assert!(result.unwrap_err().is_closed());

        let err = transport.call_value(&ctx, "two", None).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_server_request_gets_method_not_found() {
        let (transport, mut peer) = pair();

        peer.send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "sampling/createMessage"}))
            .await;
        let reply = peer.recv().await;

        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["error"]["code"], -32601);
        assert!(reply.get("result").is_none());
        drop(transport);
    }

    #[tokio::test]
    async fn test_server_request_without_method_is_invalid() {
        let (_transport, mut peer) = pair();

        peer.send(json!({"jsonrpc": "2.0", "id": 77})).await;
        let reply = peer.recv().await;

        assert_eq!(reply["id"], 77);
        assert_eq!(reply["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_request_handler_replies() {
        let (transport, mut peer) = pair();
        transport.set_request_handler(|method, params| match method {
            "roots/list" => Ok(json!({"roots": [{"uri": "file:///tmp"}]})),
            _ => anyhow::bail!("cannot handle {} with {:?}", method, params),
        });

        peer.send(json!({"jsonrpc": "2.0", "id": 1, "method": "roots/list"})).await;
        let ok = peer.recv().await;
        assert_eq!(ok["id"], 1);
        assert_eq!(ok["result"]["roots"][0]["uri"], "file:///tmp");

        peer.send(json!({"jsonrpc": "2.0", "id": 2, "method": "elicitation/create"}))
            .await;
        let failed = peer.recv().await;
        assert_eq!(failed["id"], 2);
        assert_eq!(failed["error"]["code"], -32000);
        assert!(failed["error"]["message"]
            .as_str()
            .unwrap()
            .contains("cannot handle elicitation/create"));
    }

    #[tokio::test]
    async fn test_last_request_handler_wins() {
        let (transport, mut peer) = pair();
        transport.set_request_handler(|_, _| Ok(json!("first")));
        transport.set_request_handler(|_, _| Ok(json!("second")));

        peer.send(json!({"jsonrpc": "2.0", "id": 5, "method": "x"})).await;
        assert_eq!(peer.recv().await["result"], "second");
    }

    #[tokio::test]
    async fn test_notification_handler_receives_notifications() {
        let (transport, mut peer) = pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.set_notification_handler(move |method, params| {
            let _ = tx.send((method.to_string(), params));
        });

        peer.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progress": 50}
        }))
        .await;

        let (method, params) = rx.recv().await.unwrap();
        assert_eq!(method, "notifications/progress");
        assert_eq!(params, Some(json!({"progress": 50})));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (transport, mut peer) = pair();
        let ctx = CallContext::background();

        let server = async {
            let request = peer.recv().await;
            peer.send_raw("this is not json").await;
            peer.send_raw("").await;
            peer.send_raw("[1, 2, 3]").await;
            peer.reply(&request["id"], json!({"ok": true})).await;
        };
        let (result, ()) = tokio::join!(transport.call_value(&ctx, "ping", None), server);

        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_notify_writes_notification() {
        let (transport, mut peer) = pair();

        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();
        let message = peer.recv().await;

        assert_eq!(message["method"], "notifications/initialized");
        assert!(message.get("id").is_none());
    }

    #[tokio::test]
    async fn test_stderr_stream_is_drained() {
        let (client_out, _server_in) = tokio::io::duplex(1024);
        let (_server_out, client_in) = tokio::io::duplex(1024);
        let (mut err_writer, err_reader) = tokio::io::duplex(16);

        let transport = StdioTransport::from_streams_with_stderr(client_out, client_in, err_reader);

        // Larger than the pipe buffer: only completes if the transport keeps reading.
        let noise = "diagnostic line\n".repeat(64);
        err_writer.write_all(noise.as_bytes()).await.unwrap();

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unowned_shutdown_keeps_stream_open() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut unowned = Unowned(near);

        unowned.shutdown().await.unwrap();
        unowned.write_all(b"still open").await.unwrap();
        drop(unowned);

        let mut received = String::new();
        far.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "still open");
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let err = StdioTransport::with_config(StdioConfig::new("  ")).unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn test_numeric_id_tolerance() {
        assert_eq!(numeric_id(&json!(3)), Some(3));
        assert_eq!(numeric_id(&json!(3.0)), Some(3));
        assert_eq!(numeric_id(&json!("3")), Some(3));
        assert_eq!(numeric_id(&json!(3.5)), None);
        assert_eq!(numeric_id(&json!(-1)), None);
        assert_eq!(numeric_id(&Value::Null), None);
    }

    #[test]
    fn test_config_builder() {
        let config = StdioConfig::new("npx")
            .with_args(["-y", "server"])
            .with_working_dir("/tmp")
            .with_env_var("PATH", "/usr/bin")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(config.display(), "npx -y server");
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.env.as_ref().map(BTreeMap::len), Some(1));
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_transport_trait_bounds() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StdioTransport>();
    }
}
