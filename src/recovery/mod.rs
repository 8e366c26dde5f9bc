//! Failover policy and peer recovery
//!
//! - [`FailoverPolicy`] decides whether a failed request is retried on
//!   another candidate.
//! - [`RecoveryScheduler`] re-probes failed servers on its own timer, with
//!   bounded parallelism, staggered starts and exponential backoff.
//! - [`ProbationTracker`] caps the traffic share of freshly recovered servers
//!   under [`FailoverStrategy::GradualRecovery`].

pub mod probation;
pub mod scheduler;

pub use probation::ProbationTracker;
pub use scheduler::{AttemptOutcome, RecoveryConfig, RecoveryScheduler, RecoveryTarget};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What happens when the selected server cannot serve a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    /// Retry on the next eligible candidate
    #[default]
    #[serde(alias = "IMMEDIATE")]
    Immediate,
    /// Report the failure; breaker state alone keeps bad servers out
    #[serde(alias = "CIRCUIT_BREAKER")]
    CircuitBreaker,
    /// Like `Immediate`, and recovered servers rejoin on probation
    #[serde(alias = "GRADUAL_RECOVERY")]
    GradualRecovery,
}

impl fmt::Display for FailoverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverStrategy::Immediate => f.write_str("immediate"),
            FailoverStrategy::CircuitBreaker => f.write_str("circuit_breaker"),
            FailoverStrategy::GradualRecovery => f.write_str("gradual_recovery"),
        }
    }
}

impl FromStr for FailoverStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "immediate" => Ok(FailoverStrategy::Immediate),
            "circuit_breaker" => Ok(FailoverStrategy::CircuitBreaker),
            "gradual_recovery" => Ok(FailoverStrategy::GradualRecovery),
            other => Err(format!("unknown failover strategy: {other}")),
        }
    }
}

/// Failover settings in effect for the hub
#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub strategy: FailoverStrategy,
    pub enable_auto_failover: bool,
    /// Minimum time a failed server stays out before it is re-probed
    /// under gradual recovery
    pub failback_delay: Duration,
    /// Require one successful liveness probe before a recovered server is
    /// eligible again
    pub health_check_before_failback: bool,
    /// A server on probation is eligible every Nth time it is considered
    pub probation_share: u32,
    /// Successes in a row that end probation
    pub probation_success_streak: u32,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::Immediate,
            enable_auto_failover: true,
            failback_delay: Duration::from_secs(30),
            health_check_before_failback: true,
            probation_share: 4,
            probation_success_streak: 5,
        }
    }
}

impl FailoverPolicy {
    /// Whether a peer-local failure is retried on another candidate
    pub fn retries_elsewhere(&self) -> bool {
        self.enable_auto_failover && self.strategy != FailoverStrategy::CircuitBreaker
    }

    pub fn uses_probation(&self) -> bool {
        self.strategy == FailoverStrategy::GradualRecovery
    }
}
