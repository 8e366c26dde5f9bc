//! Line-delimited JSON-RPC over child-process stdio
//!
//! [`StdioConnector`] launches a server process from its descriptor and
//! performs the initialize handshake. [`StdioTransport`] then correlates
//! responses to requests by id, so several calls can be in flight on one
//! connection. Lines on stdout that are not JSON-RPC responses (server log
//! noise, notifications) are skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{
    PeerCatalog, PeerConnector, PeerDescriptor, PeerTransport, ResourceDescriptor,
    ToolDescriptor, TransportError,
};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;

/// Code used when a tool result is flagged `isError`
const TOOL_ERROR: i64 = -32000;

const KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Removes a pending entry if the caller stops waiting (timeout, cancellation)
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl PendingGuard {
    /// Insert a waiter for `id`. Fails if the reader has already stopped,
    /// including when it stopped while the entry was being inserted.
    fn register(
        pending: &PendingMap,
        closed: &AtomicBool,
        id: u64,
        tx: oneshot::Sender<JsonRpcResponse>,
    ) -> Result<Self, TransportError> {
        if closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("server stdout closed".into()));
        }
        pending
            .lock()
            .map_err(|_| TransportError::Protocol("pending request table poisoned".into()))?
            .insert(id, tx);
        let guard = Self {
            pending: Arc::clone(pending),
            id,
        };

        // The reader sets `closed` before clearing the table, so an insert
        // that raced the final clear is caught here
        if closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("server stdout closed".into()));
        }
        Ok(guard)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// Launches peers as child processes speaking JSON-RPC on stdio
#[derive(Debug, Clone)]
pub struct StdioConnector {
    /// Timeout for the initialize handshake
    pub init_timeout: Duration,

    /// Working directory for spawned servers
    pub working_dir: Option<PathBuf>,
}

impl Default for StdioConnector {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            working_dir: None,
        }
    }
}

impl StdioConnector {
    pub fn new(init_timeout: Duration) -> Self {
        Self {
            init_timeout,
            working_dir: None,
        }
    }
}

#[async_trait]
impl PeerConnector for StdioConnector {
    async fn connect(
        &self,
        descriptor: &PeerDescriptor,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Io(format!("failed to spawn '{}': {}", descriptor.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = descriptor.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, stderr = %line, "server stderr");
                }
            });
        }

        let transport = Arc::new(StdioTransport::new(&descriptor.name, child, stdin, stdout));

        match tokio::time::timeout(self.init_timeout, transport.initialize()).await {
            Ok(Ok(())) => {
                info!(server = %descriptor.name, command = %descriptor.command, "server initialized");
                Ok(transport)
            }
            Ok(Err(e)) => {
                let _ = transport.close().await;
                Err(e)
            }
            Err(_) => {
                let _ = transport.close().await;
                Err(TransportError::Io(format!(
                    "initialization timed out after {}ms",
                    self.init_timeout.as_millis()
                )))
            }
        }
    }
}

/// Bi-directional JSON-RPC channel over one child's stdin/stdout
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    fn new(server_name: &str, child: Child, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(Self::read_loop(
            server_name.to_string(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader_task: StdMutex::new(Some(reader_task)),
        }
    }

    /// Dispatch responses from stdout to their waiting requests
    async fn read_loop(
        server_name: String,
        stdout: ChildStdout,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
    ) {
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Some((id, response)) = parse_response_line(trimmed) else {
                        debug!(server = %server_name, line = %trimmed, "skipping non-response output");
                        continue;
                    };
                    let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(server = %server_name, id = id, "response for unknown request id"),
                    }
                }
                Ok(None) => {
                    debug!(server = %server_name, "server stdout closed");
                    break;
                }
                Err(e) => {
                    warn!(server = %server_name, error = %e, "failed to read server stdout");
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with a closed error
        if let Ok(mut p) = pending.lock() {
            p.clear();
        }
    }

    async fn write_line(&self, line: String) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(format!("failed to flush stdin: {e}")))
    }

    /// Send a request and wait for the response with the same id
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard::register(&self.pending, &self.closed, id, tx).map_err(|e| match e {
            TransportError::Closed(_) => TransportError::Closed(format!(
                "server '{}' is not running",
                self.server_name
            )),
            other => other,
        })?;

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| TransportError::Protocol(format!("failed to serialize request: {e}")))?;
        line.push('\n');
        self.write_line(line).await?;

        let response = rx.await.map_err(|_| {
            TransportError::Closed(format!(
                "server '{}' stdout closed (process may have exited)",
                self.server_name
            ))
        })?;

        extract_result(response)
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method,
            params,
        };
        let mut line = serde_json::to_string(&notification)
            .map_err(|e| TransportError::Protocol(format!("failed to serialize notification: {e}")))?;
        line.push('\n');
        self.write_line(line).await
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-hub",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.request("initialize", Some(params)).await?;
        self.notify("notifications/initialized", None).await
    }
}

#[async_trait]
impl PeerTransport for StdioTransport {
    async fn fetch_catalog(&self) -> Result<PeerCatalog, TransportError> {
        let tools = self.request("tools/list", None).await?;
        let tools: Vec<ToolDescriptor> = decode_list(tools, "tools")?;

        // Resources are optional for servers that only expose tools
        let resources = match self.request("resources/list", None).await {
            Ok(value) => decode_list::<ResourceDescriptor>(value, "resources")?,
            Err(TransportError::Remote { code, .. }) if code == METHOD_NOT_FOUND => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(PeerCatalog { tools, resources })
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        let result = self
            .request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
            .await?;

        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            let message = first_text_content(&result)
                .unwrap_or_else(|| "tool reported an error".to_string());
            return Err(TransportError::Remote {
                code: TOOL_ERROR,
                message,
                data: Some(result),
            });
        }

        Ok(result)
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
        self.request("resources/read", Some(json!({ "uri": uri }))).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        match self.request("ping", None).await {
            Ok(_) => Ok(()),
            // An error reply still proves the process is alive and reading
            Err(TransportError::Remote { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(task) = self.reader_task.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.server_name, status = %status, "server exited"),
                Ok(Err(e)) => {
                    return Err(TransportError::Io(format!("failed to reap server process: {e}")))
                }
                Err(_) => warn!(server = %self.server_name, "server did not exit after kill"),
            }
        }

        Ok(())
    }
}

/// Parse one stdout line into a response with an id, if it is one
fn parse_response_line(line: &str) -> Option<(u64, JsonRpcResponse)> {
    let response: JsonRpcResponse = serde_json::from_str(line).ok()?;
    if response.result.is_none() && response.error.is_none() {
        return None;
    }
    let id = response.id?;
    Some((id, response))
}

fn extract_result(response: JsonRpcResponse) -> Result<Value, TransportError> {
    if let Some(err) = response.error {
        return Err(TransportError::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response
        .result
        .ok_or_else(|| TransportError::Protocol("response missing both result and error".into()))
}

fn decode_list<T: for<'de> Deserialize<'de>>(value: Value, field: &str) -> Result<Vec<T>, TransportError> {
    match value.get(field) {
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| TransportError::Protocol(format!("malformed '{field}' list: {e}"))),
        None => Ok(Vec::new()),
    }
}

fn first_text_content(result: &Value) -> Option<String> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|c| c.get("text").and_then(Value::as_str))
        .map(str::to_string)
}
