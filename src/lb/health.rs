use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::alerts::{AlertCondition, AlertManager, AlertThresholds, Severity};
use super::metrics::{PeerMetrics, PeerMetricsSnapshot};
use crate::pool::circuit::CircuitPhase;
use crate::pool::connection::{ConnectionState, PeerConnection};

const COMPONENT: &str = "health_monitor";

/// Configuration for the health monitor
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between monitoring ticks
    pub interval: Duration,
    /// Whether to ping connected servers on each tick
    pub enable_probes: bool,
    /// Timeout for one liveness probe
    pub probe_timeout: Duration,
    /// Window over which error rates are computed
    pub window: Duration,
    pub thresholds: AlertThresholds,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            enable_probes: true,
            probe_timeout: Duration::from_secs(5),
            window: Duration::from_secs(60),
            thresholds: AlertThresholds::default(),
        }
    }
}

/// One registered server as seen by the monitor
#[derive(Clone)]
pub struct MonitoredPeer {
    pub name: String,
    pub connection: Arc<PeerConnection>,
    pub metrics: Arc<PeerMetrics>,
    pub circuit: Option<CircuitPhase>,
    pub on_probation: bool,
}

/// Hub-wide counters that do not belong to any single server
#[derive(Debug, Clone, Copy, Default)]
pub struct HubCounters {
    pub active_recoveries: usize,
    pub queue_size: usize,
    pub rejected_requests: u64,
}

/// Where the monitor reads the current server set from
#[async_trait]
pub trait HealthSource: Send + Sync {
    /// Registered servers in registration order
    async fn monitored_peers(&self) -> Vec<MonitoredPeer>;

    fn counters(&self) -> HubCounters;
}

/// Coarse health class of one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerHealth {
    Healthy,
    Degraded,
    Failed,
}

impl PeerHealth {
    /// Failed: not invokable, or breaker open. Degraded: connection degraded,
    /// breaker half-open, or on probation.
    pub fn classify(state: ConnectionState, circuit: Option<CircuitPhase>, on_probation: bool) -> Self {
        if !state.is_invokable() || circuit == Some(CircuitPhase::Open) {
            PeerHealth::Failed
        } else if state == ConnectionState::Degraded
            || circuit == Some(CircuitPhase::HalfOpen)
            || on_probation
        {
            PeerHealth::Degraded
        } else {
            PeerHealth::Healthy
        }
    }
}

/// System-wide status
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    /// No server is failed
    pub healthy: bool,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub degraded_servers: usize,
    pub failed_servers: usize,
    pub active_recoveries: usize,
    pub queue_size: usize,
}

/// Per-server metrics rollup
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    pub name: String,
    pub health: PeerHealth,
    pub connection_state: ConnectionState,
    pub circuit: Option<CircuitPhase>,
    pub on_probation: bool,
    #[serde(flatten)]
    pub metrics: PeerMetricsSnapshot,
}

/// Request totals across every server
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestTotals {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub remote_errors: u64,
    /// Requests refused by admission control
    pub rejected: u64,
}

/// Timestamped metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub system: SystemStatus,
    pub totals: RequestTotals,
    pub servers: Vec<ServerMetrics>,
}

/// Periodic liveness probing, metrics rollup and threshold alerting.
///
/// Runs on its own timer, independent of request traffic.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    alerts: Arc<AlertManager>,
    latest: RwLock<Option<MetricsSnapshot>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, alerts: Arc<AlertManager>) -> Self {
        Self {
            config,
            alerts,
            latest: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Start the monitoring loop.
    ///
    /// The loop ends when `shutdown` flips to true or the source is dropped.
    pub fn start(
        self: Arc<Self>,
        source: Weak<dyn HealthSource>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                probes = self.config.enable_probes,
                "Health monitor started"
            );

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                let Some(source) = source.upgrade() else {
                    break;
                };

                let start = Instant::now();
                let snapshot = self.tick(source.as_ref()).await;
                debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    total = snapshot.system.total_servers,
                    failed = snapshot.system.failed_servers,
                    "Monitoring cycle completed"
                );
            }

            info!("Health monitor stopped");
        })
    }

    /// One monitoring cycle: probe, roll up, evaluate thresholds
    pub async fn tick(&self, source: &dyn HealthSource) -> MetricsSnapshot {
        let peers = source.monitored_peers().await;
        if self.config.enable_probes {
            self.probe_all(&peers).await;
        }

        let snapshot = self.collect(&peers, source.counters());
        self.evaluate(&snapshot);

        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(snapshot.clone());
        }
        snapshot
    }

    /// Ping every invokable server concurrently
    pub async fn probe_all(&self, peers: &[MonitoredPeer]) {
        let timeout = self.config.probe_timeout;
        let probes = peers
            .iter()
            .filter(|p| p.connection.state().is_invokable())
            .map(|peer| async move {
                let result = peer.connection.probe(timeout).await;
                peer.metrics.record_probe(result.is_ok());
                match result {
                    Ok(rtt) => debug!(
                        server = %peer.name,
                        rtt_ms = rtt.as_millis() as u64,
                        "Health probe OK"
                    ),
                    Err(e) => debug!(server = %peer.name, error = %e, "Health probe failed"),
                }
            });
        join_all(probes).await;
    }

    /// Classify every server and count them
    pub fn system_status(&self, peers: &[MonitoredPeer], counters: HubCounters) -> SystemStatus {
        let mut status = SystemStatus {
            healthy: true,
            total_servers: peers.len(),
            healthy_servers: 0,
            degraded_servers: 0,
            failed_servers: 0,
            active_recoveries: counters.active_recoveries,
            queue_size: counters.queue_size,
        };

        for peer in peers {
            match PeerHealth::classify(peer.connection.state(), peer.circuit, peer.on_probation) {
                PeerHealth::Healthy => status.healthy_servers += 1,
                PeerHealth::Degraded => status.degraded_servers += 1,
                PeerHealth::Failed => status.failed_servers += 1,
            }
        }
        status.healthy = status.failed_servers == 0;
        status
    }

    /// Build a metrics snapshot without probing
    pub fn collect(&self, peers: &[MonitoredPeer], counters: HubCounters) -> MetricsSnapshot {
        let system = self.system_status(peers, counters);
        let mut totals = RequestTotals {
            rejected: counters.rejected_requests,
            ..Default::default()
        };

        let servers = peers
            .iter()
            .map(|peer| {
                let metrics = peer.metrics.snapshot(self.config.window);
                totals.total_requests += metrics.total_requests;
                totals.successes += metrics.successes;
                totals.failures += metrics.failures;
                totals.timeouts += metrics.timeouts;
                totals.remote_errors += metrics.remote_errors;

                let connection_state = peer.connection.state();
                ServerMetrics {
                    name: peer.name.clone(),
                    health: PeerHealth::classify(connection_state, peer.circuit, peer.on_probation),
                    connection_state,
                    circuit: peer.circuit,
                    on_probation: peer.on_probation,
                    metrics,
                }
            })
            .collect();

        MetricsSnapshot {
            timestamp: Utc::now(),
            system,
            totals,
            servers,
        }
    }

    /// Compare a snapshot against the alert thresholds
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) {
        let thresholds = &self.config.thresholds;

        for server in &snapshot.servers {
            let name = Some(server.name.as_str());
            let m = &server.metrics;

            let error_rate_percent = m.error_rate * 100.0;
            if m.total_requests > 0 && error_rate_percent > thresholds.error_rate_percent {
                self.alerts.raise(
                    AlertCondition::HighErrorRate,
                    Severity::Warning,
                    COMPONENT,
                    name,
                    format!(
                        "Server {} error rate {:.1}% exceeds {:.1}%",
                        server.name, error_rate_percent, thresholds.error_rate_percent
                    ),
                );
            } else {
                self.alerts.resolve(AlertCondition::HighErrorRate, name);
            }

            match m.avg_response_ms {
                Some(avg) if avg > thresholds.response_time_ms as f64 => {
                    self.alerts.raise(
                        AlertCondition::SlowResponses,
                        Severity::Warning,
                        COMPONENT,
                        name,
                        format!(
                            "Server {} average response time {:.0}ms exceeds {}ms",
                            server.name, avg, thresholds.response_time_ms
                        ),
                    );
                }
                _ => {
                    self.alerts.resolve(AlertCondition::SlowResponses, name);
                }
            }

            if thresholds.consecutive_failures > 0
                && m.consecutive_failures >= thresholds.consecutive_failures
            {
                self.alerts.raise(
                    AlertCondition::ConsecutiveFailures,
                    Severity::Critical,
                    COMPONENT,
                    name,
                    format!(
                        "Server {} has {} consecutive failures",
                        server.name, m.consecutive_failures
                    ),
                );
            } else {
                self.alerts.resolve(AlertCondition::ConsecutiveFailures, name);
            }
        }

        let system = &snapshot.system;
        if system.total_servers > 0 {
            let unhealthy_percent = system.failed_servers as f64 * 100.0 / system.total_servers as f64;
            if system.failed_servers > 0 && unhealthy_percent >= thresholds.unhealthy_server_percent {
                self.alerts.raise(
                    AlertCondition::UnhealthyServers,
                    Severity::Critical,
                    COMPONENT,
                    None,
                    format!(
                        "{} of {} servers failed ({:.0}%)",
                        system.failed_servers, system.total_servers, unhealthy_percent
                    ),
                );
                return;
            }
        }
        self.alerts.resolve(AlertCondition::UnhealthyServers, None);
    }

    /// Snapshot from the most recent tick
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        self.latest.read().ok().and_then(|l| l.clone())
    }
}
