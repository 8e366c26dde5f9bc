use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::events::{EventBus, HubEvent, RecoveryOutcome};

/// Configuration for the recovery loop
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Whether the periodic loop runs; forced recoveries work regardless
    pub enabled: bool,
    pub interval: Duration,
    /// Delay between probe starts within one round
    pub stagger: Duration,
    pub max_parallel: usize,
    /// Failed attempts before giving up; 0 means never give up
    pub max_attempts: u32,
    /// Wait before the first attempt; doubles after each failed attempt
    pub base_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            stagger: Duration::from_millis(500),
            max_parallel: 3,
            max_attempts: 0,
            base_delay: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// What the scheduler recovers
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Probe or reconnect one server; Ok means it may take traffic again
    async fn attempt_recovery(&self, server: &str) -> Result<(), HubError>;

    /// The server failed `attempts` times in a row and will not be retried
    async fn recovery_exhausted(&self, server: &str, attempts: u32);
}

/// Result of one finished attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Recovered,
    Retry { after: Duration },
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
struct RecoveryEntry {
    failed_at: Instant,
    /// Registration order, breaks ties between equally old failures
    order: u64,
    attempts: u32,
    next_attempt_at: Instant,
    /// No attempt starts before this, whatever the backoff says
    not_before: Instant,
    in_progress: bool,
    exhausted: bool,
}

#[derive(Default)]
struct SchedulerState {
    entries: HashMap<String, RecoveryEntry>,
    active: usize,
}

/// Tracks failed servers and re-probes them on a timer
pub struct RecoveryScheduler {
    config: RecoveryConfig,
    state: Mutex<SchedulerState>,
    events: EventBus,
}

impl RecoveryScheduler {
    pub fn new(config: RecoveryConfig, events: EventBus) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
            events,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Backoff after `attempts` failed attempts
    pub fn backoff(&self, attempts: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempts.min(31));
        self.config
            .base_delay
            .saturating_mul(multiplier)
            .min(self.config.max_backoff.max(self.config.base_delay))
    }

    /// Start tracking a failed server. A server already tracked keeps its
    /// schedule and attempt count.
    pub fn mark_failed(&self, server: &str, order: u64) {
        self.mark_failed_after(server, order, Duration::ZERO);
    }

    /// Like [`mark_failed`](Self::mark_failed), but no attempt starts within
    /// `hold` from now. A server already tracked keeps its attempt count and
    /// has its schedule pushed back if needed.
    pub fn mark_failed_after(&self, server: &str, order: u64, hold: Duration) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = Instant::now();
        let not_before = now + hold;

        if let Some(entry) = state.entries.get_mut(server) {
            entry.not_before = entry.not_before.max(not_before);
            entry.next_attempt_at = entry.next_attempt_at.max(entry.not_before);
            return;
        }

        let delay = self.config.base_delay.max(hold);
        state.entries.insert(
            server.to_string(),
            RecoveryEntry {
                failed_at: now,
                order,
                attempts: 0,
                next_attempt_at: now + delay,
                not_before,
                in_progress: false,
                exhausted: false,
            },
        );
        debug!(
            server = %server,
            retry_in_ms = delay.as_millis() as u64,
            "Server scheduled for recovery"
        );
    }

    /// Stop tracking a server (removed, or recovered elsewhere)
    pub fn forget(&self, server: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.remove(server);
        }
    }

    pub fn is_tracked(&self, server: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.entries.contains_key(server))
            .unwrap_or(false)
    }

    pub fn is_exhausted(&self, server: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.entries.get(server).map(|e| e.exhausted).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn attempts(&self, server: &str) -> u32 {
        self.state
            .lock()
            .map(|s| s.entries.get(server).map(|e| e.attempts).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Recoveries currently running, scheduled or forced
    pub fn active_recoveries(&self) -> usize {
        self.state.lock().map(|s| s.active).unwrap_or(0)
    }

    /// Claim the servers due at `now`: oldest failure first, then
    /// registration order, bounded by the free parallel slots
    pub fn due(&self, now: Instant) -> Vec<String> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let slots = self.config.max_parallel.max(1).saturating_sub(state.active);
        if slots == 0 {
            return Vec::new();
        }

        let mut ready: Vec<(&String, &RecoveryEntry)> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.in_progress && !e.exhausted && e.next_attempt_at <= now)
            .collect();
        ready.sort_by_key(|(_, e)| (e.failed_at, e.order));

        let picked: Vec<String> = ready
            .into_iter()
            .take(slots)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &picked {
            if let Some(entry) = state.entries.get_mut(name) {
                entry.in_progress = true;
            }
        }
        state.active += picked.len();
        picked
    }

    /// Claim an out-of-schedule attempt; resets the attempt count
    fn begin_forced(&self, server: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.active += 1;
            if let Some(entry) = state.entries.get_mut(server) {
                entry.in_progress = true;
                entry.attempts = 0;
                entry.exhausted = false;
            }
        }
    }

    /// Release a claimed attempt and reschedule or drop the server
    pub fn finish(&self, server: &str, recovered: bool) -> AttemptOutcome {
        let Ok(mut state) = self.state.lock() else {
            return AttemptOutcome::Recovered;
        };
        state.active = state.active.saturating_sub(1);

        if recovered {
            state.entries.remove(server);
            return AttemptOutcome::Recovered;
        }

        let Some(entry) = state.entries.get_mut(server) else {
            return AttemptOutcome::Retry {
                after: self.config.base_delay,
            };
        };
        entry.in_progress = false;
        entry.attempts = entry.attempts.saturating_add(1);

        if self.config.max_attempts > 0 && entry.attempts >= self.config.max_attempts {
            entry.exhausted = true;
            return AttemptOutcome::Exhausted {
                attempts: entry.attempts,
            };
        }

        let now = Instant::now();
        entry.next_attempt_at = (now + self.backoff(entry.attempts)).max(entry.not_before);
        let after = entry.next_attempt_at.saturating_duration_since(now);
        AttemptOutcome::Retry { after }
    }

    /// Start the periodic recovery loop
    pub fn start(
        self: Arc<Self>,
        target: Weak<dyn RecoveryTarget>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                max_parallel = self.config.max_parallel,
                "Recovery scheduler started"
            );

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                let Some(target) = target.upgrade() else {
                    break;
                };
                self.run_once(target.as_ref()).await;
            }

            info!("Recovery scheduler stopped");
        })
    }

    /// One recovery round
    pub async fn run_once(&self, target: &dyn RecoveryTarget) -> usize {
        let due = self.due(Instant::now());
        if due.is_empty() {
            return 0;
        }
        debug!(servers = ?due, "Recovery round");

        let stagger = self.config.stagger;
        let attempts = due.iter().enumerate().map(|(i, server)| async move {
            if i > 0 && !stagger.is_zero() {
                tokio::time::sleep(stagger.saturating_mul(i as u32)).await;
            }
            let _ = self.run_attempt(target, server).await;
        });
        join_all(attempts).await;
        due.len()
    }

    /// Manually recover one server right away
    pub async fn force(&self, target: &dyn RecoveryTarget, server: &str) -> Result<(), HubError> {
        info!(server = %server, "Forced recovery");
        self.begin_forced(server);
        self.run_attempt(target, server).await
    }

    async fn run_attempt(&self, target: &dyn RecoveryTarget, server: &str) -> Result<(), HubError> {
        self.publish(server, RecoveryOutcome::Started);
        let start = Instant::now();
        let result = target.attempt_recovery(server).await;

        match self.finish(server, result.is_ok()) {
            AttemptOutcome::Recovered => {
                info!(
                    server = %server,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Server recovered"
                );
                self.publish(server, RecoveryOutcome::Succeeded);
            }
            AttemptOutcome::Retry { after } => {
                warn!(
                    server = %server,
                    retry_in_ms = after.as_millis() as u64,
                    error = ?result.as_ref().err(),
                    "Recovery attempt failed"
                );
                self.publish(server, RecoveryOutcome::Failed);
            }
            AttemptOutcome::Exhausted { attempts } => {
                error!(server = %server, attempts, "Recovery attempts exhausted");
                self.publish(server, RecoveryOutcome::Exhausted);
                target.recovery_exhausted(server, attempts).await;
            }
        }
        result
    }

    fn publish(&self, server: &str, outcome: RecoveryOutcome) {
        self.events.publish(HubEvent::Recovery {
            server: server.to_string(),
            outcome,
        });
    }
}
