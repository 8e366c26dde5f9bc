//! Scriptable in-process servers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mcp_hub::config::Config;
use mcp_hub::pool::{
    PeerCatalog, PeerConnector, PeerDescriptor, PeerTransport, ResourceDescriptor,
    ToolDescriptor, TransportError,
};
use mcp_hub::ResilienceManager;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// How a mock server answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// I/O error; the transport stays up
    Fail,
    /// The transport reports itself closed
    Close,
    /// Never answers
    Hang,
    /// Application-level error
    Remote,
}

pub struct MockServer {
    name: String,
    tools: Vec<String>,
    resources: Vec<String>,
    behavior: Mutex<Behavior>,
    connect_fails: AtomicBool,
    ping_fails: AtomicBool,
    paused: watch::Sender<bool>,
    calls: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
}

impl MockServer {
    fn new(name: &str, tools: &[&str], resources: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|t| t.to_string()).collect(),
            resources: resources.iter().map(|r| r.to_string()).collect(),
            behavior: Mutex::new(Behavior::Succeed),
            connect_fails: AtomicBool::new(false),
            ping_fails: AtomicBool::new(false),
            paused: watch::channel(false).0,
            calls: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn fail_connects(&self, fail: bool) {
        self.connect_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.ping_fails.store(fail, Ordering::SeqCst);
    }

    /// Hold every request until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Requests that reached the server and have not answered yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn catalog(&self) -> PeerCatalog {
        PeerCatalog {
            tools: self.tools.iter().map(|t| ToolDescriptor::new(t.as_str())).collect(),
            resources: self
                .resources
                .iter()
                .map(|r| ResourceDescriptor::new(r.as_str()))
                .collect(),
        }
    }

    async fn answer(&self, target: &str, arguments: Value) -> Result<Value, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight);
        self.answer_inner(target, arguments).await
    }

    async fn answer_inner(&self, target: &str, arguments: Value) -> Result<Value, TransportError> {
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Succeed => Ok(json!({
                "server": self.name,
                "target": target,
                "arguments": arguments,
            })),
            Behavior::Fail => Err(TransportError::Io("injected failure".into())),
            Behavior::Close => Err(TransportError::Closed("injected close".into())),
            Behavior::Hang => std::future::pending().await,
            Behavior::Remote => Err(TransportError::Remote {
                code: -32000,
                message: "tool rejected the input".into(),
                data: Some(json!({"target": target})),
            }),
        }
    }
}

/// Keeps `in_flight` right when a timed-out request is dropped
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockTransport {
    server: Arc<MockServer>,
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn fetch_catalog(&self) -> Result<PeerCatalog, TransportError> {
        Ok(self.server.catalog())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        self.server.answer(name, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
        self.server.answer(uri, Value::Null).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.server.ping_fails.load(Ordering::SeqCst) {
            Err(TransportError::Io("ping refused".into()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.server.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector resolving descriptors to registered [`MockServer`]s by name
#[derive(Default)]
pub struct MockConnector {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn server(&self, name: &str, tools: &[&str]) -> Arc<MockServer> {
        self.server_with_resources(name, tools, &[])
    }

    pub fn server_with_resources(
        &self,
        name: &str,
        tools: &[&str],
        resources: &[&str],
    ) -> Arc<MockServer> {
        let server = Arc::new(MockServer::new(name, tools, resources));
        self.servers
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&server));
        server
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        descriptor: &PeerDescriptor,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| TransportError::Io(format!("no such command for {}", descriptor.name)))?;

        server.connects.fetch_add(1, Ordering::SeqCst);
        if server.connect_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Io("spawn failed".into()));
        }
        Ok(Arc::new(MockTransport { server }))
    }
}

/// Config with background timers slow enough to stay out of the way
pub fn test_config() -> Config {
    let mut config = Config::new();
    config.recovery.enable_auto_recovery = false;
    config.recovery.staggered_recovery_delay_ms = 0;
    config.monitoring.enable_health_probes = false;
    config.resource_management.shutdown_grace_period_ms = 200;
    config
}

pub fn hub(config: Config, connector: &Arc<MockConnector>) -> ResilienceManager {
    ResilienceManager::new(config, Arc::clone(connector) as Arc<dyn PeerConnector>).unwrap()
}

pub fn descriptor(name: &str) -> PeerDescriptor {
    PeerDescriptor::new(name, "mock-server")
}

pub fn replica(name: &str, group: &str) -> PeerDescriptor {
    PeerDescriptor::new(name, "mock-server").with_replica_group(group)
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Synchronous flavour of [`eventually`]
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
