//! The resilience manager, shared by the binary and library callers
//!
//! [`ResilienceManager`] owns the server registry and the aggregated catalog,
//! and wires admission control, load balancing, circuit breaking, failover,
//! health monitoring and recovery into one request path:
//!
//! ```text
//! call_tool / read_resource
//!   -> resolve namespaced key (NotFound)
//!   -> admission (QueueFull)
//!   -> eligible candidates: connection invokable, circuit selectable, probation
//!   -> load balancer -> circuit permission -> concurrency slot -> invoke
//!   -> record outcome; retry another candidate per failover policy
//! ```

pub mod admission;
pub mod catalog;
pub mod registry;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionStats, ConcurrencyScope, RequestTicket};
pub use catalog::{namespaced, CapabilityEntry, CapabilityKind, NAMESPACE_SEPARATOR};
pub use registry::{PeerRecord, Registry};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{HubError, HubResult};
use crate::events::{EventBus, HubEvent, Subscription};
use crate::lb::alerts::{ActiveAlert, Alert, AlertCondition, AlertManager, Severity};
use crate::lb::balancer::{Candidate, LoadBalancer};
use crate::lb::health::{
    HealthMonitor, HealthSource, HubCounters, MetricsSnapshot, MonitoredPeer, SystemStatus,
};
use crate::lb::metrics::{Outcome, PeerMetrics};
use crate::pool::circuit::{CircuitBreaker, CircuitPhase, Permission};
use crate::pool::connection::{ConnectionState, PeerConnection};
use crate::pool::stdio::StdioConnector;
use crate::pool::transport::{Invocation, PeerCatalog, PeerConnector, PeerDescriptor};
use crate::recovery::{FailoverPolicy, ProbationTracker, RecoveryScheduler, RecoveryTarget};
use registry::Route;

const COMPONENT: &str = "resilience_manager";

/// Settings the request path reads on every call
struct Limits {
    request_timeout: Duration,
    probe_timeout: Duration,
    max_total_connections: usize,
    register_failed_servers: bool,
    degraded_after_timeouts: u32,
    shutdown_grace: Duration,
    window: Duration,
}

/// Entry point of the hub
///
/// Clones share the same registry, background loops and connections.
#[derive(Clone)]
pub struct ResilienceManager {
    pub config: Arc<Config>,
    inner: Arc<HubInner>,
}

struct HubInner {
    connector: Arc<dyn PeerConnector>,
    registry: RwLock<Registry>,
    breaker: CircuitBreaker,
    balancer: LoadBalancer,
    admission: Arc<AdmissionController>,
    policy: FailoverPolicy,
    probation: ProbationTracker,
    scheduler: Arc<RecoveryScheduler>,
    monitor: Arc<HealthMonitor>,
    alerts: Arc<AlertManager>,
    events: EventBus,
    limits: Limits,
    started: AtomicBool,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ResilienceManager {
    /// Build a manager that launches servers through `connector`.
    ///
    /// No server is connected and no background loop runs until
    /// [`connect_configured_servers`](Self::connect_configured_servers) and
    /// [`start`](Self::start) are called.
    pub fn new(config: Config, connector: Arc<dyn PeerConnector>) -> HubResult<Self> {
        config.validate().map_err(|e| HubError::Config {
            reason: format!("{e:#}"),
        })?;

        let events = EventBus::new(config.monitoring.event_buffer);
        let alerts = Arc::new(AlertManager::new(config.monitoring.max_alerts, events.clone()));
        let policy = config.failover_policy();

        let inner = HubInner {
            connector,
            registry: RwLock::new(Registry::new()),
            breaker: CircuitBreaker::new(config.circuit_breaker_config()).with_events(events.clone()),
            balancer: LoadBalancer::new(
                config.load_balancing.strategy,
                config.load_balancing.health_threshold,
            ),
            admission: Arc::new(AdmissionController::new(config.admission_config())),
            probation: ProbationTracker::new(policy.probation_share, policy.probation_success_streak),
            policy,
            scheduler: Arc::new(RecoveryScheduler::new(config.recovery_config(), events.clone())),
            monitor: Arc::new(HealthMonitor::new(config.health_monitor_config(), alerts.clone())),
            alerts,
            events,
            limits: Limits {
                request_timeout: config.request_timeout(),
                probe_timeout: config.health_probe_timeout(),
                max_total_connections: config.resource_management.max_total_connections,
                register_failed_servers: config.resource_management.register_failed_servers,
                degraded_after_timeouts: config.resource_management.degraded_after_timeouts,
                shutdown_grace: config.shutdown_grace_period(),
                window: Duration::from_millis(config.circuit_breaker.monitoring_window_ms),
            },
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx: watch::channel(false).0,
        };

        info!(
            strategy = %config.load_balancing.strategy,
            failover = %config.failover.strategy,
            max_connections = config.resource_management.max_total_connections,
            max_queue = config.resource_management.max_queue_size,
            "Resilience manager created"
        );

        Ok(Self {
            config: Arc::new(config),
            inner: Arc::new(inner),
        })
    }

    /// Build a manager that launches servers as child processes over stdio
    pub fn with_stdio(config: Config) -> HubResult<Self> {
        Self::new(config, Arc::new(StdioConnector::default()))
    }

    /// Start the health monitor and, when enabled, the recovery loop.
    /// Calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        let mut handles = Vec::with_capacity(2);

        let source: Weak<dyn HealthSource> = weak.clone();
        handles.push(
            self.inner
                .monitor
                .clone()
                .start(source, self.inner.shutdown_tx.subscribe()),
        );

        if self.inner.scheduler.config().enabled {
            let target: Weak<dyn RecoveryTarget> = weak;
            handles.push(
                self.inner
                    .scheduler
                    .clone()
                    .start(target, self.inner.shutdown_tx.subscribe()),
            );
        } else {
            info!("Automatic recovery disabled, only forced recoveries run");
        }

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Add every server listed in the configuration, in order.
    ///
    /// Returns the servers that could not be added; the others stay registered.
    pub async fn connect_configured_servers(&self) -> Vec<(String, HubError)> {
        let mut failures = Vec::new();
        for server in &self.config.servers {
            if let Err(e) = self.add_server(server.descriptor()).await {
                warn!(server = %server.name, error = %e, "Failed to add configured server");
                failures.push((server.name.clone(), e));
            }
        }
        failures
    }

    /// Register and connect a server, merging its catalog.
    ///
    /// Fails without leaving anything behind when the connection limit is
    /// reached, the name is taken, a namespaced key collides, or the connect
    /// fails (unless failed servers may be registered).
    pub async fn add_server(&self, descriptor: PeerDescriptor) -> HubResult<()> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        if descriptor.name.trim().is_empty() {
            return Err(HubError::Config {
                reason: format!("server with command '{}' has an empty name", descriptor.command),
            });
        }

        let name = descriptor.name.clone();
        let seq = inner
            .registry
            .write()
            .await
            .reserve(&name, inner.limits.max_total_connections)?;

        // Connection events stay private until the server is committed
        let (events, staged) = inner.events.staged();
        let descriptor = Arc::new(descriptor);
        let connection = Arc::new(PeerConnection::new(
            Arc::clone(&descriptor),
            Arc::clone(&inner.connector),
            inner.limits.degraded_after_timeouts,
            events,
        ));

        let (catalog, connect_error) = match connection.connect().await {
            Ok(catalog) => (catalog, None),
            Err(e) if inner.limits.register_failed_servers => {
                warn!(server = %name, error = %e, "Registering server in failed state");
                (PeerCatalog::default(), Some(e))
            }
            Err(e) => {
                staged.discard();
                inner.registry.write().await.release(&name);
                return Err(e);
            }
        };

        if inner.is_shutting_down() {
            staged.discard();
            inner.registry.write().await.release(&name);
            connection.disconnect().await;
            return Err(HubError::ShuttingDown);
        }

        let record = Arc::new(PeerRecord {
            descriptor,
            connection: Arc::clone(&connection),
            metrics: Arc::new(PeerMetrics::new()),
            seq,
            added_at: Utc::now(),
        });

        // The breaker exists before the catalog makes the server routable
        inner.breaker.register_peer(&name).await;
        let committed = inner.registry.write().await.commit(record, &catalog);
        let entries = match committed {
            Ok(entries) => entries,
            Err(e) => {
                warn!(server = %name, error = %e, "Server rejected, rolling back");
                staged.discard();
                inner.breaker.remove_peer(&name).await;
                connection.disconnect().await;
                return Err(e);
            }
        };

        staged.commit();
        if connect_error.is_some() {
            inner.scheduler.mark_failed(&name, seq);
        }

        info!(
            server = %name,
            capabilities = entries,
            state = %connection.state(),
            "Server added"
        );
        inner.events.publish(HubEvent::ServerAdded { server: name });
        Ok(())
    }

    /// Disconnect and unregister a server. Returns whether it was registered;
    /// removing an unknown server is not an error.
    pub async fn remove_server(&self, name: &str) -> bool {
        let inner = &self.inner;
        let Some(record) = inner.registry.write().await.remove(name) else {
            debug!(server = %name, "Remove of unknown server ignored");
            return false;
        };

        inner.breaker.remove_peer(name).await;
        inner.scheduler.forget(name);
        inner.probation.remove(name);
        inner.admission.forget_server(name);
        inner.alerts.resolve_server(name);
        record.connection.disconnect().await;

        info!(server = %name, "Server removed");
        inner.events.publish(HubEvent::ServerRemoved {
            server: name.to_string(),
        });
        true
    }

    /// Call a tool by its namespaced name (`server__tool`)
    pub async fn call_tool(&self, name: &str, arguments: Value) -> HubResult<Value> {
        self.inner
            .dispatch(CapabilityKind::Tool, name, |entry| Invocation::CallTool {
                name: entry.name.clone(),
                arguments,
            })
            .await
    }

    /// Read a resource by its namespaced URI (`server__uri`)
    pub async fn read_resource(&self, uri: &str) -> HubResult<Value> {
        self.inner
            .dispatch(CapabilityKind::Resource, uri, |entry| Invocation::ReadResource {
                uri: entry.name.clone(),
            })
            .await
    }

    /// Every namespaced tool, sorted by key
    pub async fn get_aggregated_tools(&self) -> Vec<CapabilityEntry> {
        self.inner.registry.read().await.catalog().tools()
    }

    /// Every namespaced resource, sorted by key
    pub async fn get_aggregated_resources(&self) -> Vec<CapabilityEntry> {
        self.inner.registry.read().await.catalog().resources()
    }

    /// Registered server names in registration order
    pub async fn server_names(&self) -> Vec<String> {
        self.inner.registry.read().await.names()
    }

    pub async fn server_state(&self, name: &str) -> Option<ConnectionState> {
        let record = self.inner.registry.read().await.get(name)?;
        Some(record.connection.state())
    }

    pub async fn circuit_phase(&self, name: &str) -> Option<CircuitPhase> {
        self.inner.breaker.get_phase(name).await
    }

    /// Live system status
    pub async fn get_system_status(&self) -> SystemStatus {
        let peers = self.inner.monitored_peers().await;
        self.inner.monitor.system_status(&peers, self.inner.hub_counters())
    }

    /// Fresh timestamped metrics snapshot
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let peers = self.inner.monitored_peers().await;
        self.inner.monitor.collect(&peers, self.inner.hub_counters())
    }

    /// Snapshot taken by the last monitoring tick, if one ran
    pub fn last_metrics(&self) -> Option<MetricsSnapshot> {
        self.inner.monitor.latest()
    }

    /// Run one monitoring cycle now: probe, roll up, evaluate alerts
    pub async fn run_health_check(&self) -> MetricsSnapshot {
        self.inner.monitor.tick(self.inner.as_ref()).await
    }

    /// Recent alerts, oldest first
    pub fn get_alerts(&self) -> Vec<Alert> {
        self.inner.alerts.recent()
    }

    /// Conditions currently breaching
    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.inner.alerts.active()
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.inner.admission.stats()
    }

    /// Subscribe to hub events
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Recover one server right away, outside the recovery schedule.
    ///
    /// Resets its attempt count, so an exhausted server gets another chance.
    pub async fn force_recovery(&self, name: &str) -> HubResult<()> {
        let record = self
            .inner
            .registry
            .read()
            .await
            .get(name)
            .ok_or_else(|| HubError::ServerNotFound {
                server: name.to_string(),
            })?;

        let result = self.inner.scheduler.force(self.inner.as_ref(), name).await;
        if result.is_err() && !self.inner.is_shutting_down() {
            self.inner.scheduler.mark_failed(name, record.seq);
        }
        result
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Stop accepting requests, wait up to the grace period for admitted
    /// ones, fail the rest, stop the background loops and disconnect every
    /// server. Later calls return immediately.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(queue_size = inner.admission.queue_size(), "Shutting down hub");

        inner.admission.close();
        if !inner.admission.drain(inner.limits.shutdown_grace).await {
            inner.admission.abort();
        }

        inner.shutdown_tx.send_replace(true);
        let tasks = inner
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let records = inner.registry.read().await.records();
        join_all(records.iter().map(|r| r.connection.disconnect())).await;

        info!(servers = records.len(), "Hub shut down");
        inner.events.close();
    }
}

impl HubInner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn dispatch<F>(&self, kind: CapabilityKind, key: &str, build: F) -> HubResult<Value>
    where
        F: FnOnce(&CapabilityEntry) -> Invocation,
    {
        let route = self
            .registry
            .read()
            .await
            .route(kind, key)
            .ok_or_else(|| HubError::NotFound {
                capability: key.to_string(),
            })?;

        let _ticket = self.admission.try_admit()?;
        let invocation = build(&route.entry);
        self.admission.guard(self.route(&route, &invocation)).await
    }

    /// Try candidates until one answers or the failover policy gives up
    async fn route(&self, route: &Route, invocation: &Invocation) -> HubResult<Value> {
        let mut attempted: HashSet<u64> = HashSet::new();
        let mut last_error: Option<HubError> = None;
        let mut blocked: Option<String> = None;

        loop {
            let open: Vec<&Arc<PeerRecord>> = route
                .candidates
                .iter()
                .filter(|r| !attempted.contains(&r.seq))
                .filter(|r| r.connection.state().is_invokable())
                .collect();

            let names: Vec<&str> = open.iter().map(|r| r.name()).collect();
            let selectable = self.breaker.selectable(&names).await;

            let mut eligible = Vec::with_capacity(open.len());
            for (record, ok) in open.into_iter().zip(selectable) {
                if ok {
                    eligible.push(record);
                } else if blocked.is_none() {
                    blocked = Some(record.name().to_string());
                }
            }

            // Servers on probation only take every Nth turn unless nothing else is left
            let sole = eligible.len() == 1;
            let admitted: Vec<&Arc<PeerRecord>> = eligible
                .iter()
                .copied()
                .filter(|r| self.probation.admit(r.name(), sole))
                .collect();
            let eligible = if admitted.is_empty() { eligible } else { admitted };

            let candidates: Vec<Candidate<'_>> = eligible
                .iter()
                .map(|r| Candidate {
                    name: r.name(),
                    active_requests: r.metrics.active_requests(),
                    avg_latency_ms: r.metrics.average_latency_ms(),
                    success_rate: r.metrics.health_rate(self.limits.window),
                })
                .collect();

            let Some(index) = self.balancer.select(&candidates) else {
                return Err(Self::exhausted(route, last_error, blocked));
            };
            let record = Arc::clone(eligible[index]);
            attempted.insert(record.seq);

            let permission = match self.breaker.check_request(record.name()).await {
                Ok(permission) => permission,
                Err(e) => {
                    debug!(server = %record.name(), error = %e, "Circuit refused request");
                    blocked.get_or_insert_with(|| record.name().to_string());
                    continue;
                }
            };

            match self.execute(&record, invocation, permission).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_peer_fault() && self.policy.retries_elsewhere() => {
                    debug!(
                        server = %record.name(),
                        target = %invocation.target(),
                        error = %e,
                        "Request failed, trying next candidate"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The error returned once no candidate is left
    fn exhausted(route: &Route, last_error: Option<HubError>, blocked: Option<String>) -> HubError {
        if let Some(e) = last_error {
            return e;
        }
        match blocked {
            Some(server) => HubError::CircuitOpen { server },
            None => HubError::NoHealthyPeer {
                capability: route.entry.key.clone(),
            },
        }
    }

    /// Send one request to one server and record the outcome everywhere
    async fn execute(
        &self,
        record: &PeerRecord,
        invocation: &Invocation,
        permission: Permission,
    ) -> HubResult<Value> {
        let name = record.name();

        let _slot = match self.admission.acquire_slot(name).await {
            Ok(slot) => slot,
            Err(e) => {
                self.breaker.release_trial(name).await;
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = {
            let _in_flight = record.metrics.begin_request();
            record
                .connection
                .invoke(invocation, self.limits.request_timeout)
                .await
        };
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => {
                record.metrics.record(Outcome::Success, elapsed);
                self.answered(name, permission).await;
                debug!(
                    server = %name,
                    target = %invocation.target(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request succeeded"
                );
            }
            Err(HubError::RemoteError { .. }) => {
                // The server answered; its health is not in question
                record.metrics.record(Outcome::RemoteError, elapsed);
                self.answered(name, permission).await;
            }
            Err(e) if e.is_peer_fault() => {
                let outcome = match e {
                    HubError::Timeout { .. } => Outcome::Timeout,
                    _ => Outcome::Failure,
                };
                record.metrics.record(outcome, elapsed);
                let phase = self.breaker.record_failure(name).await;

                if self.probation.record_failure(name) {
                    self.breaker.trip(name, true).await;
                    self.schedule_recovery(record).await;
                } else if phase == Some(CircuitPhase::Open)
                    || record.connection.state() == ConnectionState::Failed
                {
                    self.schedule_recovery(record).await;
                }
            }
            Err(_) => {
                self.breaker.release_trial(name).await;
            }
        }

        result
    }

    /// The server answered. A passed half-open trial under gradual recovery
    /// puts the server on probation instead of restoring full traffic.
    async fn answered(&self, name: &str, permission: Permission) {
        let phase = self.breaker.record_success(name).await;

        if permission == Permission::Trial
            && phase == Some(CircuitPhase::Closed)
            && self.policy.uses_probation()
        {
            self.scheduler.forget(name);
            self.probation.start(name);
        } else if self.probation.record_success(name) {
            self.breaker.clear_penalty(name).await;
        }
    }

    /// Hand a server to the recovery loop, never earlier than its circuit
    /// allows a retry
    async fn schedule_recovery(&self, record: &PeerRecord) {
        let name = record.name();
        let hold = self
            .breaker
            .get_stats(name)
            .await
            .and_then(|stats| stats.retry_in)
            .unwrap_or_default();
        self.scheduler.mark_failed_after(name, record.seq, hold);
    }

    fn hub_counters(&self) -> HubCounters {
        HubCounters {
            active_recoveries: self.scheduler.active_recoveries(),
            queue_size: self.admission.queue_size(),
            rejected_requests: self.admission.rejected(),
        }
    }
}

#[async_trait]
impl HealthSource for HubInner {
    async fn monitored_peers(&self) -> Vec<MonitoredPeer> {
        let records = self.registry.read().await.records();
        let mut peers = Vec::with_capacity(records.len());

        for record in records {
            let name = record.name().to_string();
            // Transports that died outside user traffic are picked up here
            if record.connection.state() == ConnectionState::Failed
                && !self.is_shutting_down()
                && !self.scheduler.is_tracked(&name)
            {
                self.scheduler.mark_failed(&name, record.seq);
            }

            peers.push(MonitoredPeer {
                circuit: self.breaker.get_phase(&name).await,
                on_probation: self.probation.is_on_probation(&name),
                connection: Arc::clone(&record.connection),
                metrics: Arc::clone(&record.metrics),
                name,
            });
        }
        peers
    }

    fn counters(&self) -> HubCounters {
        self.hub_counters()
    }
}

#[async_trait]
impl RecoveryTarget for HubInner {
    async fn attempt_recovery(&self, server: &str) -> HubResult<()> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        let record = self
            .registry
            .read()
            .await
            .get(server)
            .ok_or_else(|| HubError::ServerNotFound {
                server: server.to_string(),
            })?;
        let connection = &record.connection;

        if connection.state().is_invokable() {
            // Still connected; only the circuit is open
            let probe = connection.probe(self.limits.probe_timeout).await;
            record.metrics.record_probe(probe.is_ok());
            probe?;
        } else {
            let health_probe = self
                .policy
                .health_check_before_failback
                .then_some(self.limits.probe_timeout);
            let catalog = connection.recover(health_probe).await?;

            let mut registry = self.registry.write().await;
            let current = registry.get(server);
            if current.map(|r| Arc::ptr_eq(&r, &record)).unwrap_or(false) {
                let skipped = registry.refresh_catalog(server, &catalog);
                if !skipped.is_empty() {
                    warn!(server = %server, skipped = ?skipped, "Colliding capabilities left out after reconnect");
                }
            }
        }

        self.breaker.reset_circuit(server).await;
        record.metrics.reset_failure_streak();
        if self.policy.uses_probation() {
            self.probation.start(server);
        }
        self.alerts.resolve(AlertCondition::RecoveryExhausted, Some(server));
        Ok(())
    }

    async fn recovery_exhausted(&self, server: &str, attempts: u32) {
        if let Some(record) = self.registry.read().await.get(server) {
            record.connection.mark_failed();
        }
        self.alerts.raise(
            AlertCondition::RecoveryExhausted,
            Severity::Critical,
            COMPONENT,
            Some(server),
            format!("Server {server} did not recover after {attempts} attempts"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::transport::{PeerTransport, ToolDescriptor, TransportError};
    use std::sync::atomic::AtomicUsize;

    /// Transport whose tools all echo their arguments
    struct EchoTransport {
        tools: Vec<String>,
        fail: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerTransport for EchoTransport {
        async fn fetch_catalog(&self) -> Result<PeerCatalog, TransportError> {
            Ok(PeerCatalog {
                tools: self.tools.iter().map(|t| ToolDescriptor::new(t.as_str())).collect(),
                resources: Vec::new(),
            })
        }

        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(TransportError::Io("boom".into()))
            } else {
                Ok(arguments)
            }
        }

        async fn read_resource(&self, uri: &str) -> Result<Value, TransportError> {
            Ok(Value::String(uri.to_string()))
        }

        async fn ping(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct EchoConnector {
        fail: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerConnector for EchoConnector {
        async fn connect(
            &self,
            _descriptor: &PeerDescriptor,
        ) -> Result<Arc<dyn PeerTransport>, TransportError> {
            Ok(Arc::new(EchoTransport {
                tools: vec!["echo".into(), "other".into()],
                fail: Arc::clone(&self.fail),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    fn manager(config: Config) -> (ResilienceManager, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let connector = EchoConnector::default();
        let fail = Arc::clone(&connector.fail);
        let calls = Arc::clone(&connector.calls);
        let manager = ResilienceManager::new(config, Arc::new(connector)).unwrap();
        (manager, fail, calls)
    }

    #[tokio::test]
    async fn test_call_routes_to_owner() {
        let (hub, _, calls) = manager(Config::new());
        hub.add_server(PeerDescriptor::new("a", "cmd")).await.unwrap();

        let result = hub
            .call_tool("a__echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["x"], 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let tools = hub.get_aggregated_tools().await;
        let keys: Vec<_> = tools.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["a__echo", "a__other"]);
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let (hub, _, _) = manager(Config::new());
        let err = hub.call_tool("a__echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_open_circuit_skips_transport() {
        let mut config = Config::new();
        config.circuit_breaker.failure_threshold = 2;
        config.circuit_breaker.recovery_timeout_ms = 60_000;
        let (hub, fail, calls) = manager(config);
        hub.add_server(PeerDescriptor::new("a", "cmd")).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        for _ in 0..2 {
            let err = hub.call_tool("a__echo", Value::Null).await.unwrap_err();
            assert!(matches!(err, HubError::Transport { .. }));
        }
        assert_eq!(hub.circuit_phase("a").await, Some(CircuitPhase::Open));

        let err = hub.call_tool("a__echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, HubError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forced_recovery_closes_circuit() {
        let mut config = Config::new();
        config.circuit_breaker.failure_threshold = 1;
        let (hub, fail, _) = manager(config);
        hub.add_server(PeerDescriptor::new("a", "cmd")).await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let _ = hub.call_tool("a__echo", Value::Null).await;
        assert_eq!(hub.get_system_status().await.failed_servers, 1);

        fail.store(false, Ordering::SeqCst);
        hub.force_recovery("a").await.unwrap();
        assert_eq!(hub.circuit_phase("a").await, Some(CircuitPhase::Closed));
        assert_eq!(hub.get_system_status().await.failed_servers, 0);

        assert!(matches!(
            hub.force_recovery("missing").await,
            Err(HubError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (hub, _, _) = manager(Config::new());
        hub.add_server(PeerDescriptor::new("a", "cmd")).await.unwrap();
        hub.start();

        hub.shutdown().await;
        hub.shutdown().await;

        assert_eq!(hub.server_state("a").await, Some(ConnectionState::Disconnected));
        assert!(matches!(
            hub.call_tool("a__echo", Value::Null).await,
            Err(HubError::ShuttingDown)
        ));
        assert!(matches!(
            hub.add_server(PeerDescriptor::new("b", "cmd")).await,
            Err(HubError::ShuttingDown)
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::new();
        config.circuit_breaker.failure_threshold = 0;
        let result = ResilienceManager::new(config, Arc::new(EchoConnector::default()));
        assert!(matches!(result, Err(HubError::Config { .. })));
    }
}
