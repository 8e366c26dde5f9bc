//! Transport boundary between the hub and its backend servers
//!
//! The hub never spawns processes or frames messages itself. It is handed a
//! [`PeerConnector`] that turns a [`PeerDescriptor`] into a live
//! [`PeerTransport`]; everything else in the crate talks to peers through
//! these two traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Unique identifier for a peer (its registered name)
pub type PeerId = String;

/// Immutable launch and identity record for a backend server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Unique server name, also the namespace prefix of its capabilities
    pub name: String,

    /// Executable to launch
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Servers sharing a group are interchangeable for capabilities they both advertise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_group: Option<String>,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            description: None,
            replica_group: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_replica_group(mut self, group: impl Into<String>) -> Self {
        self.replica_group = Some(group.into());
        self
    }
}

/// Tool advertised by a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
        }
    }
}

/// Resource advertised by a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "mimeType", alias = "mime_type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: None,
            description: None,
            mime_type: None,
        }
    }
}

/// Tools and resources a peer currently advertises
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerCatalog {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,

    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// Errors surfaced by a transport implementation
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed: {0}")]
    Closed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer answered with an application-level error
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

/// A request routed to one peer
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    CallTool { name: String, arguments: Value },
    ReadResource { uri: String },
}

impl Invocation {
    /// Peer-local capability name (tool name or resource URI)
    pub fn target(&self) -> &str {
        match self {
            Invocation::CallTool { name, .. } => name,
            Invocation::ReadResource { uri } => uri,
        }
    }
}

/// Live request/response channel to one peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// List the tools and resources the peer currently offers
    async fn fetch_catalog(&self) -> Result<PeerCatalog, TransportError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, TransportError>;

    /// Liveness probe independent of user traffic
    async fn ping(&self) -> Result<(), TransportError> {
        self.fetch_catalog().await.map(|_| ())
    }

    /// Tear the channel down; implementations should be idempotent
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory that launches a peer from its descriptor
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &PeerDescriptor,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
