//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a per-peer circuit breaker with three states:
//! - Closed: Normal operation, requests are allowed
//! - Open: Peer is failing, requests are rejected without touching the transport
//! - HalfOpen: Exactly one trial request is allowed through
//!
//! A breaker trips after `failure_threshold` consecutive failures that all fall
//! inside `monitoring_window`. After `recovery_timeout` (or `failback_delay`,
//! whichever is longer) it lets one trial through; success closes it, failure
//! reopens it and restarts the timer.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::transport::PeerId;
use crate::error::HubError;
use crate::events::{EventBus, HubEvent};

/// Circuit breaker error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open for server {server}, retry in {retry_in:?}")]
    CircuitOpen { server: String, retry_in: Duration },

    #[error("Half-open circuit for server {0} already has a trial request in flight")]
    TrialInFlight(String),

    #[error("Server not registered with circuit breaker: {0}")]
    PeerNotFound(String),
}

impl From<CircuitError> for HubError {
    fn from(err: CircuitError) -> Self {
        match err {
            CircuitError::CircuitOpen { server, .. } | CircuitError::TrialInFlight(server) => {
                HubError::CircuitOpen { server }
            }
            CircuitError::PeerNotFound(server) => HubError::ServerNotFound { server },
        }
    }
}

/// Data-free view of a circuit state, suitable for events and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitPhase::Closed => f.write_str("CLOSED"),
            CircuitPhase::Open => f.write_str("OPEN"),
            CircuitPhase::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Peer has failed - requests are rejected
    Open {
        /// When the circuit may move to HalfOpen
        retry_at: Instant,

        /// Consecutive failures that caused the circuit to open
        failure_count: u32,
    },

    /// Testing recovery - a single trial request is allowed
    HalfOpen {
        /// Whether the trial request has been handed out
        trial_in_flight: bool,
    },
}

impl CircuitState {
    /// Whether a router may pick this peer right now (does not claim the trial)
    pub fn is_selectable(&self) -> bool {
        match self {
            CircuitState::Closed => true,
            CircuitState::Open { retry_at, .. } => Instant::now() >= *retry_at,
            CircuitState::HalfOpen { trial_in_flight } => !trial_in_flight,
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        match self {
            CircuitState::Closed => CircuitPhase::Closed,
            CircuitState::Open { .. } => CircuitPhase::Open,
            CircuitState::HalfOpen { .. } => CircuitPhase::HalfOpen,
        }
    }

    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen { .. } => "HalfOpen",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (within the window) before opening the circuit
    pub failure_threshold: u32,

    /// How long to stay open before allowing a trial request
    pub recovery_timeout: Duration,

    /// Failures older than this no longer count toward the threshold
    pub monitoring_window: Duration,

    /// Upper bound on the penalty multiplier applied to `recovery_timeout`
    pub max_penalty_multiplier: u32,

    /// Floor on the open period, so a server is not retried before it may fail back
    pub failback_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
            max_penalty_multiplier: 32,
            failback_delay: Duration::ZERO,
        }
    }
}

/// Per-peer circuit breaker state and statistics
struct PeerCircuit {
    state: CircuitState,

    /// Failures of the current streak that are still inside the window
    recent_failures: VecDeque<Instant>,

    total_successes: u64,
    total_failures: u64,

    /// Requests refused while open or with a trial in flight
    total_rejections: u64,

    last_transition: Instant,
    open_count: u64,

    /// Number of penalty trips since the peer last proved itself
    penalty_level: u32,
}

impl PeerCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
            last_transition: Instant::now(),
            open_count: 0,
            penalty_level: 0,
        }
    }

    fn consecutive_failures(&self) -> u32 {
        self.recent_failures.len() as u32
    }

    fn open_duration(&self, config: &CircuitBreakerConfig) -> Duration {
        let multiplier = 2u32
            .saturating_pow(self.penalty_level)
            .min(config.max_penalty_multiplier.max(1));
        config
            .recovery_timeout
            .max(config.failback_delay)
            .saturating_mul(multiplier)
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.recent_failures.clear();
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self, config: &CircuitBreakerConfig) {
        let retry_at = Instant::now() + self.open_duration(config);
        self.state = CircuitState::Open {
            retry_at,
            failure_count: self.consecutive_failures(),
        };
        self.open_count += 1;
        self.last_transition = Instant::now();
    }

    fn transition_to_half_open(&mut self, trial_in_flight: bool) {
        self.state = CircuitState::HalfOpen { trial_in_flight };
        self.last_transition = Instant::now();
    }

    fn stats(&self) -> CircuitStats {
        let total = self.total_successes + self.total_failures;
        CircuitStats {
            phase: self.state.phase(),
            consecutive_failures: self.consecutive_failures(),
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
            error_rate: if total == 0 {
                0.0
            } else {
                self.total_failures as f64 / total as f64
            },
            open_count: self.open_count,
            penalty_level: self.penalty_level,
            time_in_state: self.last_transition.elapsed(),
            retry_in: match &self.state {
                CircuitState::Open { retry_at, .. } => {
                    Some(retry_at.saturating_duration_since(Instant::now()))
                }
                _ => None,
            },
        }
    }
}

/// What [`CircuitBreaker::check_request`] granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// The circuit is closed
    Normal,
    /// The single half-open trial; its outcome decides whether the circuit closes
    Trial,
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,

    /// Failures over all recorded outcomes
    pub error_rate: f64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    pub penalty_level: u32,

    /// Time since last state transition
    pub time_in_state: Duration,

    /// Remaining open time, when open
    pub retry_in: Option<Duration>,
}

/// Circuit breaker manager for all peers
pub struct CircuitBreaker {
    circuits: Arc<RwLock<HashMap<PeerId, PeerCircuit>>>,
    config: CircuitBreakerConfig,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker manager
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Arc::new(RwLock::new(HashMap::new())),
            config,
            events: None,
        }
    }

    /// Publish state changes on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn publish(&self, peer_id: &str, from: CircuitPhase, to: CircuitPhase) {
        if from == to {
            return;
        }
        if let Some(events) = &self.events {
            events.publish(HubEvent::CircuitStateChanged {
                server: peer_id.to_string(),
                from,
                to,
            });
        }
    }

    /// Register a peer with the circuit breaker
    pub async fn register_peer(&self, peer_id: &str) {
        let mut circuits = self.circuits.write().await;
        if !circuits.contains_key(peer_id) {
            debug!(server = %peer_id, "Registering server with circuit breaker");
            circuits.insert(peer_id.to_string(), PeerCircuit::new());
        }
    }

    /// Remove a peer from the circuit breaker
    pub async fn remove_peer(&self, peer_id: &str) {
        let mut circuits = self.circuits.write().await;
        if circuits.remove(peer_id).is_some() {
            debug!(server = %peer_id, "Removed server from circuit breaker");
        }
    }

    /// Ask permission to send one request.
    ///
    /// Moves an expired Open circuit to HalfOpen and hands out its single
    /// trial. Every granted permission must be followed by exactly one of
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release_trial`](Self::release_trial).
    pub async fn check_request(&self, peer_id: &str) -> Result<Permission, CircuitError> {
        let mut circuits = self.circuits.write().await;

        let circuit = circuits
            .get_mut(peer_id)
            .ok_or_else(|| CircuitError::PeerNotFound(peer_id.to_string()))?;

        match circuit.state.clone() {
            CircuitState::Closed => Ok(Permission::Normal),

            CircuitState::Open { retry_at, .. } => {
                let now = Instant::now();
                if now >= retry_at {
                    info!(server = %peer_id, "Circuit transitioning from Open to HalfOpen");
                    circuit.transition_to_half_open(true);
                    self.publish(peer_id, CircuitPhase::Open, CircuitPhase::HalfOpen);
                    Ok(Permission::Trial)
                } else {
                    circuit.total_rejections += 1;
                    Err(CircuitError::CircuitOpen {
                        server: peer_id.to_string(),
                        retry_in: retry_at.saturating_duration_since(now),
                    })
                }
            }

            CircuitState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    circuit.total_rejections += 1;
                    Err(CircuitError::TrialInFlight(peer_id.to_string()))
                } else {
                    circuit.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(Permission::Trial)
                }
            }
        }
    }

    /// Record a successful request; returns the resulting phase
    pub async fn record_success(&self, peer_id: &str) -> Option<CircuitPhase> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(peer_id)?;

        circuit.total_successes += 1;

        match circuit.state {
            CircuitState::Closed => {
                circuit.recent_failures.clear();
            }

            CircuitState::Open { .. } => {
                // A straggler that was admitted before the circuit opened
                debug!(server = %peer_id, "Recorded success in Open state, staying open");
            }

            CircuitState::HalfOpen { .. } => {
                info!(server = %peer_id, "Trial request succeeded, circuit transitioning from HalfOpen to Closed");
                circuit.transition_to_closed();
                self.publish(peer_id, CircuitPhase::HalfOpen, CircuitPhase::Closed);
            }
        }

        Some(circuit.state.phase())
    }

    /// Record a failed request; returns the resulting phase
    pub async fn record_failure(&self, peer_id: &str) -> Option<CircuitPhase> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(peer_id)?;

        circuit.total_failures += 1;
        let now = Instant::now();

        match circuit.state {
            CircuitState::Closed => {
                circuit.recent_failures.push_back(now);
                let window = self.config.monitoring_window;
                while let Some(oldest) = circuit.recent_failures.front() {
                    if now.duration_since(*oldest) >= window {
                        circuit.recent_failures.pop_front();
                    } else {
                        break;
                    }
                }

                debug!(
                    server = %peer_id,
                    consecutive_failures = circuit.consecutive_failures(),
                    threshold = self.config.failure_threshold,
                    "Request failed in Closed state"
                );

                if circuit.consecutive_failures() >= self.config.failure_threshold {
                    warn!(
                        server = %peer_id,
                        consecutive_failures = circuit.consecutive_failures(),
                        "Circuit transitioning from Closed to Open"
                    );
                    circuit.transition_to_open(&self.config);
                    self.publish(peer_id, CircuitPhase::Closed, CircuitPhase::Open);
                }
            }

            CircuitState::Open { .. } => {
                debug!(server = %peer_id, "Request failed in Open state");
            }

            CircuitState::HalfOpen { .. } => {
                warn!(server = %peer_id, "Trial request failed - reopening circuit");
                circuit.transition_to_open(&self.config);
                self.publish(peer_id, CircuitPhase::HalfOpen, CircuitPhase::Open);
            }
        }

        Some(circuit.state.phase())
    }

    /// Give back a trial permission whose request produced no verdict
    pub async fn release_trial(&self, peer_id: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(peer_id) {
            if let CircuitState::HalfOpen { trial_in_flight: true } = circuit.state {
                circuit.state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    /// Force the circuit open.
    ///
    /// With `penalty` the open period is doubled for every penalty trip since
    /// the last [`clear_penalty`](Self::clear_penalty), up to
    /// `max_penalty_multiplier`.
    pub async fn trip(&self, peer_id: &str, penalty: bool) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(peer_id) {
            if penalty {
                circuit.penalty_level = circuit.penalty_level.saturating_add(1);
            }
            let from = circuit.state.phase();
            circuit.transition_to_open(&self.config);
            warn!(
                server = %peer_id,
                penalty_level = circuit.penalty_level,
                open_for_ms = circuit.open_duration(&self.config).as_millis() as u64,
                "Circuit forced open"
            );
            self.publish(peer_id, from, CircuitPhase::Open);
        }
    }

    /// Forget accumulated penalty trips
    pub async fn clear_penalty(&self, peer_id: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(peer_id) {
            circuit.penalty_level = 0;
        }
    }

    /// Manually reset a circuit to closed state
    pub async fn reset_circuit(&self, peer_id: &str) {
        let mut circuits = self.circuits.write().await;

        if let Some(circuit) = circuits.get_mut(peer_id) {
            let from = circuit.state.phase();
            circuit.transition_to_closed();
            if from != CircuitPhase::Closed {
                info!(server = %peer_id, from = %from, "Resetting circuit to Closed");
                self.publish(peer_id, from, CircuitPhase::Closed);
            }
        }
    }

    /// Get the current state of a peer's circuit
    pub async fn get_state(&self, peer_id: &str) -> Option<CircuitState> {
        let circuits = self.circuits.read().await;
        circuits.get(peer_id).map(|c| c.state.clone())
    }

    pub async fn get_phase(&self, peer_id: &str) -> Option<CircuitPhase> {
        let circuits = self.circuits.read().await;
        circuits.get(peer_id).map(|c| c.state.phase())
    }

    /// Whether each peer may currently be selected, under one read lock
    pub async fn selectable(&self, peer_ids: &[&str]) -> Vec<bool> {
        let circuits = self.circuits.read().await;
        peer_ids
            .iter()
            .map(|id| circuits.get(*id).map(|c| c.state.is_selectable()).unwrap_or(false))
            .collect()
    }

    /// Get statistics for a peer's circuit
    pub async fn get_stats(&self, peer_id: &str) -> Option<CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits.get(peer_id).map(PeerCircuit::stats)
    }

    /// Get statistics for all peers
    pub async fn get_all_stats(&self) -> HashMap<PeerId, CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits
            .iter()
            .map(|(id, circuit)| (id.clone(), circuit.stats()))
            .collect()
    }

    /// Check if a peer is healthy (circuit is closed)
    pub async fn is_healthy(&self, peer_id: &str) -> bool {
        let circuits = self.circuits.read().await;
        circuits
            .get(peer_id)
            .map(|c| matches!(c.state, CircuitState::Closed))
            .unwrap_or(false)
    }
}
