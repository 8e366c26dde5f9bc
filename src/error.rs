//! Error types returned by the hub
//!
//! Every failure a caller can observe is one [`HubError`]. Variants carry the
//! peer and capability involved so a failed request can be diagnosed without
//! walking a chain of nested causes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a [`HubError`], stable for presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConnectionLimitExceeded,
    DuplicateServer,
    CapabilityConflict,
    NotConnected,
    Transport,
    Timeout,
    CircuitOpen,
    NoHealthyPeer,
    QueueFull,
    NotFound,
    ServerNotFound,
    RemoteError,
    ShuttingDown,
    Config,
}

/// Errors produced by the resilience and routing layer
#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("connection limit of {limit} servers reached, cannot add '{server}'")]
    ConnectionLimitExceeded { server: String, limit: usize },

    #[error("server '{server}' is already registered")]
    DuplicateServer { server: String },

    #[error("capability '{key}' from server '{server}' collides with an entry owned by '{owner}'")]
    CapabilityConflict {
        key: String,
        server: String,
        owner: String,
    },

    #[error("server '{server}' is not connected")]
    NotConnected { server: String },

    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    #[error("request '{capability}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        capability: String,
        timeout_ms: u64,
    },

    #[error("circuit breaker is open for server '{server}'")]
    CircuitOpen { server: String },

    #[error("no healthy server available for '{capability}'")]
    NoHealthyPeer { capability: String },

    #[error("request queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("unknown capability: '{capability}'")]
    NotFound { capability: String },

    #[error("unknown server: '{server}'")]
    ServerNotFound { server: String },

    #[error("server '{server}' returned error [{code}]: {message}")]
    RemoteError {
        server: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("hub is shutting down")]
    ShuttingDown,

    #[error("config error: {reason}")]
    Config { reason: String },
}

impl HubError {
    /// Classification used by `error{kind, message}` renderings
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::ConnectionLimitExceeded { .. } => ErrorKind::ConnectionLimitExceeded,
            HubError::DuplicateServer { .. } => ErrorKind::DuplicateServer,
            HubError::CapabilityConflict { .. } => ErrorKind::CapabilityConflict,
            HubError::NotConnected { .. } => ErrorKind::NotConnected,
            HubError::Transport { .. } => ErrorKind::Transport,
            HubError::Timeout { .. } => ErrorKind::Timeout,
            HubError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            HubError::NoHealthyPeer { .. } => ErrorKind::NoHealthyPeer,
            HubError::QueueFull { .. } => ErrorKind::QueueFull,
            HubError::NotFound { .. } => ErrorKind::NotFound,
            HubError::ServerNotFound { .. } => ErrorKind::ServerNotFound,
            HubError::RemoteError { .. } => ErrorKind::RemoteError,
            HubError::ShuttingDown => ErrorKind::ShuttingDown,
            HubError::Config { .. } => ErrorKind::Config,
        }
    }

    /// Name of the server the error is attributed to, if any
    pub fn server(&self) -> Option<&str> {
        match self {
            HubError::ConnectionLimitExceeded { server, .. }
            | HubError::DuplicateServer { server }
            | HubError::CapabilityConflict { server, .. }
            | HubError::NotConnected { server }
            | HubError::Transport { server, .. }
            | HubError::Timeout { server, .. }
            | HubError::CircuitOpen { server }
            | HubError::ServerNotFound { server }
            | HubError::RemoteError { server, .. } => Some(server),
            _ => None,
        }
    }

    /// Whether this failure says something about the peer's health.
    ///
    /// Only transport-level faults feed the circuit breaker and failover;
    /// a remote application error means the peer answered.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            HubError::NotConnected { .. } | HubError::Transport { .. } | HubError::Timeout { .. }
        )
    }

    /// Serializable `{kind, message}` view for presentation layers
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            server: self.server().map(str::to_string),
        }
    }
}

/// Wire-friendly rendering of a [`HubError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

pub type HubResult<T> = Result<T, HubError>;
