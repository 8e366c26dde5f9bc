//! Load balancing, health monitoring and alerting
//!
//! # Components
//!
//! - [`PeerMetrics`]: per-server counters and latency window, updated lock-free
//!   from concurrent request completions
//! - [`LoadBalancer`]: picks one server among the eligible candidates
//! - [`HealthMonitor`]: periodic probing, metrics rollup and threshold checks
//! - [`AlertManager`]: deduplicated alerts with a bounded history
//!
//! # Load Balancing Strategies
//!
//! - **Round-robin**: cycle through eligible servers in registration order
//! - **Least-connections**: fewest in-flight requests, ties to the earliest server
//! - **Least-response-time**: lowest rolling average; unsampled servers count as zero
//! - **Health-weighted**: weighted random by recent success rate, excluding
//!   servers under `health_threshold`
//! - **Random**: uniform
//!
//! # Health Classes
//!
//! A server is *failed* when its connection is not invokable or its circuit is
//! open, *degraded* when its connection is degraded, its circuit is half-open
//! or it is on probation, and *healthy* otherwise.

pub mod alerts;
pub mod balancer;
pub mod health;
pub mod metrics;

pub use alerts::{ActiveAlert, Alert, AlertCondition, AlertManager, AlertThresholds, Severity};
pub use balancer::{Candidate, LoadBalancer, Strategy};
pub use health::{
    HealthMonitor, HealthMonitorConfig, HealthSource, HubCounters, MetricsSnapshot, MonitoredPeer,
    PeerHealth, RequestTotals, ServerMetrics, SystemStatus,
};
pub use metrics::{InFlight, Outcome, PeerMetrics, PeerMetricsSnapshot};
