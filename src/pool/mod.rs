//! Peer connections and circuit breaking
//!
//! This module provides:
//! - The transport boundary ([`PeerConnector`], [`PeerTransport`]) the hub is handed
//! - A stdio JSON-RPC implementation of that boundary
//! - Per-peer connection lifecycle with a published state machine
//! - Circuit breaker pattern for fault isolation

pub mod circuit;
pub mod connection;
pub mod stdio;
pub mod transport;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitPhase, CircuitState, CircuitStats,
    Permission,
};
pub use connection::{ConnectionState, PeerConnection};
pub use stdio::{StdioConnector, StdioTransport};
pub use transport::{
    Invocation, PeerCatalog, PeerConnector, PeerDescriptor, PeerId, PeerTransport,
    ResourceDescriptor, ToolDescriptor, TransportError,
};
