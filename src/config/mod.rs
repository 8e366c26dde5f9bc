use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core::admission::{AdmissionConfig, ConcurrencyScope};
use crate::lb::alerts::AlertThresholds;
use crate::lb::balancer::Strategy;
use crate::lb::health::HealthMonitorConfig;
use crate::pool::circuit::CircuitBreakerConfig;
use crate::pool::transport::PeerDescriptor;
use crate::recovery::{FailoverPolicy, FailoverStrategy, RecoveryConfig};

/// One backend server to launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
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

    /// Servers in the same group may serve each other's capabilities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_group: Option<String>,
}

impl ServerConfig {
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            description: self.description.clone(),
            replica_group: self.replica_group.clone(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open a server's circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit waits before a trial request
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Failures older than this do not count toward the threshold
    #[serde(default = "default_monitoring_window_ms")]
    pub monitoring_window_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_monitoring_window_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            monitoring_window_ms: default_monitoring_window_ms(),
        }
    }
}

/// Load balancing and request execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingSettings {
    /// round_robin, least_connections, least_response_time, health_weighted, random
    #[serde(default)]
    pub strategy: Strategy,

    /// Minimum success rate (0.0..=1.0) for health-weighted selection
    #[serde(default = "default_health_threshold")]
    pub health_threshold: f64,

    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Whether the concurrency cap is hub-wide or per server
    #[serde(default)]
    pub concurrency_scope: ConcurrencyScope,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_health_threshold() -> f64 {
    0.5
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for LoadBalancingSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            health_threshold: default_health_threshold(),
            max_concurrent_requests: default_max_concurrent_requests(),
            concurrency_scope: ConcurrencyScope::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Failover settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSettings {
    /// immediate, circuit_breaker, gradual_recovery
    #[serde(default)]
    pub strategy: FailoverStrategy,

    #[serde(default = "default_true")]
    pub enable_auto_failover: bool,

    #[serde(default = "default_failback_delay_ms")]
    pub failback_delay_ms: u64,

    #[serde(default = "default_true")]
    pub health_check_before_failback: bool,

    /// A server on probation is eligible every Nth time it is considered
    #[serde(default = "default_probation_share")]
    pub probation_share: u32,

    #[serde(default = "default_probation_success_streak")]
    pub probation_success_streak: u32,
}

fn default_true() -> bool {
    true
}

fn default_failback_delay_ms() -> u64 {
    30_000
}

fn default_probation_share() -> u32 {
    4
}

fn default_probation_success_streak() -> u32 {
    5
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::default(),
            enable_auto_failover: true,
            failback_delay_ms: default_failback_delay_ms(),
            health_check_before_failback: true,
            probation_share: default_probation_share(),
            probation_success_streak: default_probation_success_streak(),
        }
    }
}

/// Recovery loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    #[serde(default = "default_true")]
    pub enable_auto_recovery: bool,

    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    #[serde(default = "default_staggered_recovery_delay_ms")]
    pub staggered_recovery_delay_ms: u64,

    #[serde(default = "default_max_parallel_recoveries")]
    pub max_parallel_recoveries: usize,

    /// Failed attempts before a server is given up on (0 = never)
    #[serde(default)]
    pub max_recovery_attempts: u32,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_recovery_interval_ms() -> u64 {
    10_000
}

fn default_staggered_recovery_delay_ms() -> u64 {
    500
}

fn default_max_parallel_recoveries() -> usize {
    3
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enable_auto_recovery: true,
            recovery_interval_ms: default_recovery_interval_ms(),
            staggered_recovery_delay_ms: default_staggered_recovery_delay_ms(),
            max_parallel_recoveries: default_max_parallel_recoveries(),
            max_recovery_attempts: 0,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Connection and queue limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSettings {
    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Keep servers whose first connect fails, marked failed, instead of
    /// rejecting them
    #[serde(default)]
    pub register_failed_servers: bool,

    /// How long shutdown waits for admitted requests
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,

    /// Timeouts in a row before a connection counts as degraded
    #[serde(default = "default_degraded_after_timeouts")]
    pub degraded_after_timeouts: u32,
}

fn default_max_total_connections() -> usize {
    50
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_shutdown_grace_period_ms() -> u64 {
    5_000
}

fn default_degraded_after_timeouts() -> u32 {
    3
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_total_connections: default_max_total_connections(),
            max_queue_size: default_max_queue_size(),
            register_failed_servers: false,
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            degraded_after_timeouts: default_degraded_after_timeouts(),
        }
    }
}

/// Health monitoring and alerting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,

    #[serde(default = "default_true")]
    pub enable_health_probes: bool,

    #[serde(default = "default_health_probe_timeout_ms")]
    pub health_probe_timeout_ms: u64,

    /// Size of the recent-alerts buffer
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,

    /// Events buffered per subscriber before slow subscribers lag
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
}

fn default_metrics_interval_ms() -> u64 {
    30_000
}

fn default_health_probe_timeout_ms() -> u64 {
    5_000
}

fn default_max_alerts() -> usize {
    100
}

fn default_event_buffer() -> usize {
    256
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            metrics_interval_ms: default_metrics_interval_ms(),
            enable_health_probes: true,
            health_probe_timeout_ms: default_health_probe_timeout_ms(),
            max_alerts: default_max_alerts(),
            event_buffer: default_event_buffer(),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Servers connected at startup, in registration order
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub load_balancing: LoadBalancingSettings,

    #[serde(default)]
    pub failover: FailoverSettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub resource_management: ResourceSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

impl Config {
    /// Create a configuration with every default and no servers
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values the hub cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.monitoring_window_ms == 0 {
            anyhow::bail!("circuit_breaker.monitoring_window_ms must be positive");
        }
        if !(0.0..=1.0).contains(&self.load_balancing.health_threshold) {
            anyhow::bail!(
                "load_balancing.health_threshold must be within 0..=1, got {}",
                self.load_balancing.health_threshold
            );
        }
        if self.load_balancing.max_concurrent_requests == 0 {
            anyhow::bail!("load_balancing.max_concurrent_requests must be at least 1");
        }
        if self.load_balancing.request_timeout_ms == 0 {
            anyhow::bail!("load_balancing.request_timeout_ms must be positive");
        }
        if self.resource_management.max_total_connections == 0 {
            anyhow::bail!("resource_management.max_total_connections must be at least 1");
        }
        if self.resource_management.max_queue_size == 0 {
            anyhow::bail!("resource_management.max_queue_size must be at least 1");
        }
        if self.recovery.max_parallel_recoveries == 0 {
            anyhow::bail!("recovery.max_parallel_recoveries must be at least 1");
        }
        if self.recovery.recovery_interval_ms == 0 || self.monitoring.metrics_interval_ms == 0 {
            anyhow::bail!("recovery and monitoring intervals must be positive");
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                anyhow::bail!("server with command '{}' has an empty name", server.command);
            }
            if !seen.insert(server.name.as_str()) {
                anyhow::bail!("server '{}' is listed twice", server.name);
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.load_balancing.request_timeout_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.resource_management.shutdown_grace_period_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.monitoring.health_probe_timeout_ms)
    }

    /// Breaker settings. Under gradual recovery an open circuit stays open
    /// for at least the failback delay.
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let failback_delay = if self.failover.strategy == FailoverStrategy::GradualRecovery {
            Duration::from_millis(self.failover.failback_delay_ms)
        } else {
            Duration::ZERO
        };

        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            recovery_timeout: Duration::from_millis(self.circuit_breaker.recovery_timeout_ms),
            monitoring_window: Duration::from_millis(self.circuit_breaker.monitoring_window_ms),
            failback_delay,
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_queue_size: self.resource_management.max_queue_size,
            max_concurrent_requests: self.load_balancing.max_concurrent_requests,
            scope: self.load_balancing.concurrency_scope,
        }
    }

    pub fn failover_policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            strategy: self.failover.strategy,
            enable_auto_failover: self.failover.enable_auto_failover,
            failback_delay: Duration::from_millis(self.failover.failback_delay_ms),
            health_check_before_failback: self.failover.health_check_before_failback,
            probation_share: self.failover.probation_share,
            probation_success_streak: self.failover.probation_success_streak,
        }
    }

    /// Recovery loop settings. The first attempt waits one breaker recovery
    /// timeout, or the failback delay under gradual recovery if that is longer.
    pub fn recovery_config(&self) -> RecoveryConfig {
        let mut base_delay = Duration::from_millis(self.circuit_breaker.recovery_timeout_ms);
        if self.failover.strategy == FailoverStrategy::GradualRecovery {
            base_delay = base_delay.max(Duration::from_millis(self.failover.failback_delay_ms));
        }

        RecoveryConfig {
            enabled: self.recovery.enable_auto_recovery,
            interval: Duration::from_millis(self.recovery.recovery_interval_ms),
            stagger: Duration::from_millis(self.recovery.staggered_recovery_delay_ms),
            max_parallel: self.recovery.max_parallel_recoveries,
            max_attempts: self.recovery.max_recovery_attempts,
            base_delay,
            max_backoff: Duration::from_millis(self.recovery.max_backoff_ms),
        }
    }

    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            interval: Duration::from_millis(self.monitoring.metrics_interval_ms),
            enable_probes: self.monitoring.enable_health_probes,
            probe_timeout: self.health_probe_timeout(),
            window: Duration::from_millis(self.circuit_breaker.monitoring_window_ms),
            thresholds: self.monitoring.alert_thresholds.clone(),
        }
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Parse `MCP_HUB_SERVERS`: entries separated by `;`, each
/// `name=command arg1 arg2`
fn parse_servers(raw: &str) -> Result<Vec<ServerConfig>> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (name, command_line) = entry
                .split_once('=')
                .with_context(|| format!("Server entry '{entry}' is not in name=command form"))?;
            let mut parts = command_line.split_whitespace();
            let command = parts
                .next()
                .with_context(|| format!("Server entry '{entry}' has no command"))?;
            Ok(ServerConfig {
                name: name.trim().to_string(),
                command: command.to_string(),
                args: parts.map(str::to_string).collect(),
                env: HashMap::new(),
                description: None,
                replica_group: None,
            })
        })
        .collect()
}

/// Read and parse one optional variable
fn env_value<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {key}: {e}")),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// Reads a `.env` file first if one exists. Recognised variables:
/// - MCP_HUB_SERVERS (`name=command args;name2=command2`)
/// - MCP_HUB_LB_STRATEGY, MCP_HUB_FAILOVER_STRATEGY
/// - MCP_HUB_REQUEST_TIMEOUT_MS, MCP_HUB_MAX_CONCURRENT_REQUESTS
/// - MCP_HUB_FAILURE_THRESHOLD, MCP_HUB_RECOVERY_TIMEOUT_MS
/// - MCP_HUB_MAX_CONNECTIONS, MCP_HUB_MAX_QUEUE_SIZE
/// - MCP_HUB_AUTO_RECOVERY, MCP_HUB_METRICS_INTERVAL_MS
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(servers) = std::env::var("MCP_HUB_SERVERS") {
        config.servers = parse_servers(&servers).context("Failed to parse MCP_HUB_SERVERS")?;
    }

    if let Some(strategy) = env_value("MCP_HUB_LB_STRATEGY")? {
        config.load_balancing.strategy = strategy;
    }
    if let Some(strategy) = env_value("MCP_HUB_FAILOVER_STRATEGY")? {
        config.failover.strategy = strategy;
    }
    if let Some(timeout) = env_value("MCP_HUB_REQUEST_TIMEOUT_MS")? {
        config.load_balancing.request_timeout_ms = timeout;
    }
    if let Some(max) = env_value("MCP_HUB_MAX_CONCURRENT_REQUESTS")? {
        config.load_balancing.max_concurrent_requests = max;
    }
    if let Some(threshold) = env_value("MCP_HUB_FAILURE_THRESHOLD")? {
        config.circuit_breaker.failure_threshold = threshold;
    }
    if let Some(timeout) = env_value("MCP_HUB_RECOVERY_TIMEOUT_MS")? {
        config.circuit_breaker.recovery_timeout_ms = timeout;
    }
    if let Some(max) = env_value("MCP_HUB_MAX_CONNECTIONS")? {
        config.resource_management.max_total_connections = max;
    }
    if let Some(max) = env_value("MCP_HUB_MAX_QUEUE_SIZE")? {
        config.resource_management.max_queue_size = max;
    }
    if let Some(enabled) = env_value("MCP_HUB_AUTO_RECOVERY")? {
        config.recovery.enable_auto_recovery = enabled;
    }
    if let Some(interval) = env_value("MCP_HUB_METRICS_INTERVAL_MS")? {
        config.monitoring.metrics_interval_ms = interval;
    }

    config.validate().context("Invalid configuration from environment")?;
    Ok(config)
}

/// Load configuration from file or environment
///
/// Reads the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => load_from_yaml(path),
        None => load_from_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
servers:
  - name: fs
    command: node
    args: ["fs-server.js", "--root", "/tmp"]
    env:
      DEBUG: "1"
    description: File access
  - name: search
    command: python
    replica_group: search

circuit_breaker:
  failure_threshold: 3
  recovery_timeout_ms: 1000

load_balancing:
  strategy: LEAST_CONNECTIONS
  concurrency_scope: per_server

failover:
  strategy: gradual_recovery
  failback_delay_ms: 5000

monitoring:
  alert_thresholds:
    error_rate_percent: 25
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.servers.len(), 2);
        let fs = config.servers[0].descriptor();
        assert_eq!(fs.args, vec!["fs-server.js", "--root", "/tmp"]);
        assert_eq!(fs.env.get("DEBUG").map(String::as_str), Some("1"));
        assert_eq!(config.servers[1].replica_group.as_deref(), Some("search"));

        assert_eq!(config.load_balancing.strategy, Strategy::LeastConnections);
        assert_eq!(config.load_balancing.concurrency_scope, ConcurrencyScope::PerServer);
        assert_eq!(config.failover.strategy, FailoverStrategy::GradualRecovery);
        assert_eq!(config.monitoring.alert_thresholds.error_rate_percent, 25.0);
        assert_eq!(config.monitoring.alert_thresholds.consecutive_failures, 5);

        // Gradual recovery waits for the longer failback delay
        assert_eq!(config.recovery_config().base_delay, Duration::from_secs(5));
        assert_eq!(config.circuit_breaker_config().failure_threshold, 3);
    }

    #[test]
    fn test_default_values() {
        let config: Config = serde_yaml::from_str("servers: []").unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.load_balancing.strategy, Strategy::RoundRobin);
        assert_eq!(config.failover.strategy, FailoverStrategy::Immediate);
        assert!(config.recovery.enable_auto_recovery);
        assert_eq!(config.resource_management.max_queue_size, 1000);
        assert!(!config.resource_management.register_failed_servers);
        assert_eq!(config.recovery_config().base_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::new();
        config.load_balancing.health_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.resource_management.max_queue_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::new();
        let server = ServerConfig {
            name: "a".into(),
            command: "cmd".into(),
            args: vec![],
            env: HashMap::new(),
            description: None,
            replica_group: None,
        };
        config.servers = vec![server.clone(), server];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_servers() {
        let servers = parse_servers("fs=node fs.js --root /tmp; git=git-server ;").unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "fs");
        assert_eq!(servers[0].command, "node");
        assert_eq!(servers[0].args, vec!["fs.js", "--root", "/tmp"]);
        assert_eq!(servers[1].command, "git-server");

        assert!(parse_servers("no-equals-sign").is_err());
        assert!(parse_servers("empty=").is_err());
    }
}
