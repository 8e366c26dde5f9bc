//! Per-peer connection lifecycle
//!
//! A [`PeerConnection`] owns one backend server's transport and walks it
//! through the connection state machine:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED <-> DEGRADED
//!                      |            |            |
//!                      v            v            v
//!                    FAILED <---------------------
//!                      |
//!                      v
//!                  RECOVERING -> CONNECTED | FAILED
//! ```
//!
//! Every transition is published on the event bus while the state lock is
//! held, so observers see one peer's transitions in the order they happened.
//!
//! Timeouts are best-effort cancellation: the caller stops waiting, but the
//! remote server may still finish the work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::transport::{
    Invocation, PeerCatalog, PeerConnector, PeerDescriptor, PeerTransport, TransportError,
};
use crate::error::HubError;
use crate::events::{EventBus, HubEvent};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
    Recovering,
}

impl ConnectionState {
    /// Requests may only be sent while connected or degraded
    pub fn is_invokable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Degraded => "DEGRADED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Recovering => "RECOVERING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One backend server's transport and lifecycle
pub struct PeerConnection {
    descriptor: Arc<PeerDescriptor>,
    connector: Arc<dyn PeerConnector>,
    transport: StdRwLock<Option<Arc<dyn PeerTransport>>>,
    state: StdMutex<ConnectionState>,
    catalog: StdRwLock<PeerCatalog>,

    /// Timeouts since the last answered request
    consecutive_timeouts: AtomicU32,

    /// Timeouts in a row before the connection is marked degraded
    degrade_after_timeouts: u32,

    events: EventBus,

    /// Serializes connect / recover / disconnect
    lifecycle: Mutex<()>,
}

impl PeerConnection {
    pub fn new(
        descriptor: Arc<PeerDescriptor>,
        connector: Arc<dyn PeerConnector>,
        degrade_after_timeouts: u32,
        events: EventBus,
    ) -> Self {
        Self {
            descriptor,
            connector,
            transport: StdRwLock::new(None),
            state: StdMutex::new(ConnectionState::Disconnected),
            catalog: StdRwLock::new(PeerCatalog::default()),
            consecutive_timeouts: AtomicU32::new(0),
            degrade_after_timeouts: degrade_after_timeouts.max(1),
            events,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<PeerDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Failed)
    }

    /// Last catalog fetched from the peer
    pub fn catalog(&self) -> PeerCatalog {
        self.catalog
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    /// Move to `to`, publishing the change. Returns the previous state.
    fn transition(&self, to: ConnectionState) -> ConnectionState {
        let Ok(mut state) = self.state.lock() else {
            return ConnectionState::Failed;
        };
        let from = *state;
        if from == to {
            return from;
        }
        *state = to;

        match to {
            ConnectionState::Failed => warn!(server = %self.name(), from = %from, "connection failed"),
            ConnectionState::Degraded => warn!(server = %self.name(), from = %from, "connection degraded"),
            _ => info!(server = %self.name(), from = %from, to = %to, "connection state change"),
        }

        self.events.publish(HubEvent::ConnectionStateChanged {
            server: self.descriptor.name.clone(),
            from,
            to,
        });
        from
    }

    /// Move to `to` only when the current state satisfies `allowed`
    fn transition_if(&self, allowed: impl Fn(ConnectionState) -> bool, to: ConnectionState) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let from = *state;
        if from == to || !allowed(from) {
            return false;
        }
        *state = to;

        warn!(server = %self.name(), from = %from, to = %to, "connection state change");
        self.events.publish(HubEvent::ConnectionStateChanged {
            server: self.descriptor.name.clone(),
            from,
            to,
        });
        true
    }

    fn current_transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.read().ok().and_then(|t| t.clone())
    }

    fn install(&self, transport: Arc<dyn PeerTransport>, catalog: PeerCatalog) {
        if let Ok(mut slot) = self.transport.write() {
            *slot = Some(transport);
        }
        if let Ok(mut current) = self.catalog.write() {
            *current = catalog;
        }
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    fn take_transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.write().ok().and_then(|mut t| t.take())
    }

    /// Launch the peer and fetch its catalog
    async fn establish(&self) -> Result<(Arc<dyn PeerTransport>, PeerCatalog), HubError> {
        let transport = self
            .connector
            .connect(&self.descriptor)
            .await
            .map_err(|e| self.transport_error(e))?;

        match transport.fetch_catalog().await {
            Ok(catalog) => Ok((transport, catalog)),
            Err(e) => {
                let _ = transport.close().await;
                Err(self.transport_error(e))
            }
        }
    }

    fn transport_error(&self, err: TransportError) -> HubError {
        match err {
            TransportError::Remote { code, message, data } => HubError::RemoteError {
                server: self.descriptor.name.clone(),
                code,
                message,
                data,
            },
            other => HubError::Transport {
                server: self.descriptor.name.clone(),
                reason: other.to_string(),
            },
        }
    }

    /// Connect the peer and load its catalog.
    ///
    /// A failure leaves the connection `FAILED` and is returned to the caller;
    /// retrying is the recovery scheduler's job.
    pub async fn connect(&self) -> Result<PeerCatalog, HubError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state().is_invokable() {
            return Ok(self.catalog());
        }

        self.transition(ConnectionState::Connecting);
        let start = Instant::now();

        match self.establish().await {
            Ok((transport, catalog)) => {
                info!(
                    server = %self.name(),
                    tools = catalog.tools.len(),
                    resources = catalog.resources.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "server connected"
                );
                self.install(transport, catalog.clone());
                self.transition(ConnectionState::Connected);
                Ok(catalog)
            }
            Err(e) => {
                warn!(server = %self.name(), error = %e, "server connection failed");
                self.transition(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Tear down the current transport and reconnect from scratch.
    ///
    /// When `health_probe` is set, the fresh transport must also answer one
    /// liveness probe within that timeout before the peer counts as connected.
    pub async fn recover(&self, health_probe: Option<Duration>) -> Result<PeerCatalog, HubError> {
        let _lifecycle = self.lifecycle.lock().await;

        self.transition(ConnectionState::Recovering);

        if let Some(old) = self.take_transport() {
            if let Err(e) = old.close().await {
                debug!(server = %self.name(), error = %e, "error closing previous transport");
            }
        }

        let (transport, catalog) = match self.establish().await {
            Ok(pair) => pair,
            Err(e) => {
                self.transition(ConnectionState::Failed);
                return Err(e);
            }
        };

        if let Some(timeout) = health_probe {
            let probe = tokio::time::timeout(timeout, transport.ping()).await;
            let failure = match probe {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(self.transport_error(e)),
                Err(_) => Some(HubError::Timeout {
                    server: self.descriptor.name.clone(),
                    capability: "ping".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };
            if let Some(e) = failure {
                let _ = transport.close().await;
                self.transition(ConnectionState::Failed);
                return Err(e);
            }
        }

        self.install(transport, catalog.clone());
        self.transition(ConnectionState::Connected);
        Ok(catalog)
    }

    /// Execute one request against the peer.
    ///
    /// Valid only while `CONNECTED` or `DEGRADED`. A timeout abandons the wait
    /// but cannot stop the peer from finishing the work.
    pub async fn invoke(&self, invocation: &Invocation, timeout: Duration) -> Result<Value, HubError> {
        let not_connected = || HubError::NotConnected {
            server: self.descriptor.name.clone(),
        };

        if !self.state().is_invokable() {
            return Err(not_connected());
        }
        let transport = self.current_transport().ok_or_else(not_connected)?;

        let call = async {
            match invocation {
                Invocation::CallTool { name, arguments } => {
                    transport.call_tool(name, arguments.clone()).await
                }
                Invocation::ReadResource { uri } => transport.read_resource(uri).await,
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                self.on_answered();
                Ok(value)
            }
            Ok(Err(TransportError::Remote { code, message, data })) => {
                self.on_answered();
                Err(HubError::RemoteError {
                    server: self.descriptor.name.clone(),
                    code,
                    message,
                    data,
                })
            }
            Ok(Err(TransportError::Closed(reason))) => {
                self.transition_if(|s| s.is_invokable(), ConnectionState::Failed);
                Err(HubError::Transport {
                    server: self.descriptor.name.clone(),
                    reason: format!("transport closed: {reason}"),
                })
            }
            Ok(Err(e)) => Err(self.transport_error(e)),
            Err(_) => {
                let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    server = %self.name(),
                    target = %invocation.target(),
                    consecutive_timeouts = timeouts,
                    "request timed out"
                );
                if timeouts >= self.degrade_after_timeouts {
                    self.transition_if(|s| s == ConnectionState::Connected, ConnectionState::Degraded);
                }
                Err(HubError::Timeout {
                    server: self.descriptor.name.clone(),
                    capability: invocation.target().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn on_answered(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        self.transition_if(|s| s == ConnectionState::Degraded, ConnectionState::Connected);
    }

    /// Liveness probe outside user traffic; returns the round-trip time
    pub async fn probe(&self, timeout: Duration) -> Result<Duration, HubError> {
        let not_connected = || HubError::NotConnected {
            server: self.descriptor.name.clone(),
        };
        if !self.state().is_invokable() {
            return Err(not_connected());
        }
        let transport = self.current_transport().ok_or_else(not_connected)?;

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, transport.ping()).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(self.transport_error(e)),
            Err(_) => Err(HubError::Timeout {
                server: self.descriptor.name.clone(),
                capability: "ping".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(_) => self.on_answered(),
            Err(_) => {
                self.transition_if(|s| s == ConnectionState::Connected, ConnectionState::Degraded);
            }
        }
        result
    }

    /// Mark the peer failed (for example when its circuit opens)
    pub fn mark_failed(&self) -> bool {
        self.transition_if(
            |s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::Degraded | ConnectionState::Disconnected
                )
            },
            ConnectionState::Failed,
        )
    }

    /// Close the transport. Idempotent, and always succeeds locally.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(transport) = self.take_transport() {
            if let Err(e) = transport.close().await {
                warn!(server = %self.name(), error = %e, "error closing transport, ignoring");
            }
        }
        if let Ok(mut catalog) = self.catalog.write() {
            *catalog = PeerCatalog::default();
        }
        self.transition(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::transport::ToolDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct ScriptedTransport {
        hang: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn fetch_catalog(&self) -> Result<PeerCatalog, TransportError> {
            Ok(PeerCatalog {
                tools: vec![ToolDescriptor::new("echo")],
                resources: Vec::new(),
            })
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            match name {
                "fail" => Err(TransportError::Remote {
                    code: -1,
                    message: "nope".into(),
                    data: None,
                }),
                "crash" => Err(TransportError::Closed("eof".into())),
                _ => Ok(arguments),
            }
        }

        async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
            Ok(Value::String(uri.to_string()))
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Err(TransportError::Io("already gone".into()))
        }
    }

    struct ScriptedConnector {
        transport: Arc<ScriptedTransport>,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl PeerConnector for ScriptedConnector {
        async fn connect(
            &self,
            _descriptor: &PeerDescriptor,
        ) -> Result<Arc<dyn PeerTransport>, TransportError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Io("spawn failed".into()));
            }
            Ok(self.transport.clone())
        }
    }

    fn connection(refuse: bool) -> (PeerConnection, Arc<ScriptedTransport>, EventBus) {
        let transport = Arc::new(ScriptedTransport::default());
        let connector = Arc::new(ScriptedConnector {
            transport: transport.clone(),
            refuse: AtomicBool::new(refuse),
        });
        let events = EventBus::new(64);
        let conn = PeerConnection::new(
            Arc::new(PeerDescriptor::new("test", "true")),
            connector,
            2,
            events.clone(),
        );
        (conn, transport, events)
    }

    #[tokio::test]
    async fn test_connect_publishes_transitions_in_order() {
        let (conn, _, events) = connection(false);
        let mut sub = events.subscribe();

        let catalog = conn.connect().await.unwrap();
        assert_eq!(catalog.tools.len(), 1);
        assert_eq!(conn.state(), ConnectionState::Connected);

        let states: Vec<_> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                HubEvent::ConnectionStateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ConnectionState::Connecting, ConnectionState::Connected]);
    }

    #[tokio::test]
    async fn test_connect_failure_marks_failed() {
        let (conn, _, _) = connection(true);
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, HubError::Transport { .. }));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_invoke_requires_connection() {
        let (conn, _, _) = connection(false);
        let call = Invocation::CallTool {
            name: "echo".into(),
            arguments: Value::Null,
        };
        let err = conn.invoke(&call, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HubError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_remote_error_passes_through() {
        let (conn, _, _) = connection(false);
        conn.connect().await.unwrap();
        let call = Invocation::CallTool {
            name: "fail".into(),
            arguments: Value::Null,
        };
        let err = conn.invoke(&call, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HubError::RemoteError { code: -1, .. }));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_repeated_timeouts_degrade_then_recover() {
        let (conn, transport, _) = connection(false);
        conn.connect().await.unwrap();

        transport.hang.store(true, Ordering::SeqCst);
        let call = Invocation::CallTool {
            name: "echo".into(),
            arguments: Value::Null,
        };
        for _ in 0..2 {
            let err = conn.invoke(&call, Duration::from_millis(20)).await.unwrap_err();
            assert!(matches!(err, HubError::Timeout { .. }));
        }
        assert_eq!(conn.state(), ConnectionState::Degraded);

        transport.hang.store(false, Ordering::SeqCst);
        conn.invoke(&call, Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.consecutive_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_fails_connection() {
        let (conn, _, _) = connection(false);
        conn.connect().await.unwrap();
        let call = Invocation::CallTool {
            name: "crash".into(),
            arguments: Value::Null,
        };
        let err = conn.invoke(&call, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HubError::Transport { .. }));
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (conn, transport, _) = connection(false);
        conn.connect().await.unwrap();

        conn.disconnect().await;
        conn.disconnect().await;

        assert!(transport.closed.load(Ordering::SeqCst));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.catalog().tools.is_empty());
    }

    #[tokio::test]
    async fn test_recover_from_failed() {
        let (conn, _, _) = connection(false);
        conn.connect().await.unwrap();
        assert!(conn.mark_failed());
        assert_eq!(conn.state(), ConnectionState::Failed);

        conn.recover(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }
}
