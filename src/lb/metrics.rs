use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

/// Latency samples kept per peer
const LATENCY_SAMPLES: usize = 256;

/// Outcomes kept per peer for windowed error rates
const OUTCOME_SAMPLES: usize = 1024;

/// Rolling window of response times
#[derive(Debug, Default)]
struct LatencyWindow {
    samples_ms: VecDeque<f64>,
}

impl LatencyWindow {
    fn push(&mut self, latency: Duration) {
        if self.samples_ms.len() == LATENCY_SAMPLES {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(latency.as_secs_f64() * 1000.0);
    }

    fn average(&self) -> Option<f64> {
        if self.samples_ms.is_empty() {
            return None;
        }
        Some(self.samples_ms.iter().sum::<f64>() / self.samples_ms.len() as f64)
    }

    /// Nearest-rank percentile, `p` in 0..=100
    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[idx])
    }
}

/// Request outcome as seen by the metrics layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The peer answered with an application error
    RemoteError,
    /// Transport failure or the peer was unreachable
    Failure,
    Timeout,
}

impl Outcome {
    fn is_error(self) -> bool {
        !matches!(self, Outcome::Success)
    }

    /// Whether the outcome says something is wrong with the peer itself
    fn is_peer_fault(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Timeout)
    }
}

/// Per-peer counters, updated concurrently from request completions
#[derive(Debug)]
pub struct PeerMetrics {
    /// Requests currently executing against this peer
    active_requests: AtomicU32,

    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    remote_errors: AtomicU64,

    /// Errors of any kind since the last success
    consecutive_failures: AtomicU32,

    probe_failures: AtomicU64,

    latency: Mutex<LatencyWindow>,
    outcomes: Mutex<VecDeque<(Instant, Outcome)>>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
}

impl Default for PeerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self {
            active_requests: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            remote_errors: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            probe_failures: AtomicU64::new(0),
            latency: Mutex::new(LatencyWindow::default()),
            outcomes: Mutex::new(VecDeque::new()),
            last_health_check: RwLock::new(None),
        }
    }

    /// Count a request as in flight until the returned guard drops
    pub fn begin_request(&self) -> InFlight<'_> {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        InFlight { metrics: self }
    }

    pub fn active_requests(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Record the result of one request
    pub fn record(&self, outcome: Outcome, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Outcome::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Outcome::RemoteError => {
                self.remote_errors.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Timeout => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Timed-out calls carry no real response time
        if outcome != Outcome::Timeout {
            if let Ok(mut window) = self.latency.lock() {
                window.push(latency);
            }
        }

        if let Ok(mut outcomes) = self.outcomes.lock() {
            if outcomes.len() == OUTCOME_SAMPLES {
                outcomes.pop_front();
            }
            outcomes.push_back((Instant::now(), outcome));
        }
    }

    /// Record a liveness probe result
    pub fn record_probe(&self, ok: bool) {
        if !ok {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.update_last_health_check();
    }

    pub fn update_last_health_check(&self) {
        if let Ok(mut last) = self.last_health_check.write() {
            *last = Some(Utc::now());
        }
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.last_health_check.read().ok().and_then(|l| *l)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Forget the current failure streak (after a successful recovery)
    pub fn reset_failure_streak(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        self.latency.lock().ok().and_then(|w| w.average())
    }

    /// Share of requests inside `window` that did not succeed, application
    /// errors included
    pub fn error_rate(&self, window: Duration) -> Option<f64> {
        self.window_share(window, Outcome::is_error)
    }

    /// Share of requests inside `window` the peer handled without a
    /// transport failure or timeout. Application errors count as handled.
    /// `None` without samples.
    pub fn health_rate(&self, window: Duration) -> Option<f64> {
        self.window_share(window, Outcome::is_peer_fault)
            .map(|rate| 1.0 - rate)
    }

    fn window_share(&self, window: Duration, counts: fn(Outcome) -> bool) -> Option<f64> {
        let (total, matching) = self.window_counts(window, counts);
        if total == 0 {
            return None;
        }
        Some(matching as f64 / total as f64)
    }

    fn window_counts(&self, window: Duration, counts: fn(Outcome) -> bool) -> (usize, usize) {
        let Ok(mut outcomes) = self.outcomes.lock() else {
            return (0, 0);
        };
        let now = Instant::now();
        while let Some((at, _)) = outcomes.front() {
            if now.duration_since(*at) > window {
                outcomes.pop_front();
            } else {
                break;
            }
        }
        let matching = outcomes.iter().filter(|(_, o)| counts(*o)).count();
        (outcomes.len(), matching)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, window: Duration) -> PeerMetricsSnapshot {
        let (avg, p50, p95, p99) = match self.latency.lock() {
            Ok(w) => (w.average(), w.percentile(50.0), w.percentile(95.0), w.percentile(99.0)),
            Err(_) => (None, None, None, None),
        };

        PeerMetricsSnapshot {
            active_requests: self.active_requests(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            error_rate: self.error_rate(window).unwrap_or(0.0),
            avg_response_ms: avg,
            p50_response_ms: p50,
            p95_response_ms: p95,
            p99_response_ms: p99,
            last_health_check: self.last_health_check(),
        }
    }
}

/// Decrements the active-request count when dropped
pub struct InFlight<'a> {
    metrics: &'a PeerMetrics,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serializable copy of a peer's counters
#[derive(Debug, Clone, Serialize)]
pub struct PeerMetricsSnapshot {
    pub active_requests: u32,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub remote_errors: u64,
    pub consecutive_failures: u32,
    pub probe_failures: u64,
    /// Errors over requests inside the monitoring window, 0.0..=1.0
    pub error_rate: f64,
    pub avg_response_ms: Option<f64>,
    pub p50_response_ms: Option<f64>,
    pub p95_response_ms: Option<f64>,
    pub p99_response_ms: Option<f64>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_metrics_creation() {
        let metrics = PeerMetrics::new();
        assert_eq!(metrics.active_requests(), 0);
        assert_eq!(metrics.consecutive_failures(), 0);
        assert!(metrics.average_latency_ms().is_none());
        assert!(metrics.health_rate(WINDOW).is_none());
    }

    #[test]
    fn test_in_flight_guard() {
        let metrics = PeerMetrics::new();
        {
            let _a = metrics.begin_request();
            let _b = metrics.begin_request();
            assert_eq!(metrics.active_requests(), 2);
        }
        assert_eq!(metrics.active_requests(), 0);
    }

    #[test]
    fn test_failure_tracking() {
        let metrics = PeerMetrics::new();

        metrics.record(Outcome::Failure, Duration::from_millis(10));
        metrics.record(Outcome::Timeout, Duration::from_millis(500));
        metrics.record(Outcome::RemoteError, Duration::from_millis(10));
        assert_eq!(metrics.consecutive_failures(), 3);

        metrics.record(Outcome::Success, Duration::from_millis(30));
        assert_eq!(metrics.consecutive_failures(), 0);

        let snap = metrics.snapshot(WINDOW);
        assert_eq!(snap.total_requests, 4);
        assert_eq!(snap.failures, 2);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.remote_errors, 1);
        assert!((snap.error_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_remote_errors_keep_peer_healthy() {
        let metrics = PeerMetrics::new();
        for _ in 0..3 {
            metrics.record(Outcome::RemoteError, Duration::from_millis(5));
        }
        assert_eq!(metrics.health_rate(WINDOW), Some(1.0));
        assert_eq!(metrics.error_rate(WINDOW), Some(1.0));

        metrics.record(Outcome::Timeout, Duration::from_millis(5));
        assert!((metrics.health_rate(WINDOW).unwrap() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_statistics_skip_timeouts() {
        let metrics = PeerMetrics::new();
        for ms in [10, 20, 30, 40] {
            metrics.record(Outcome::Success, Duration::from_millis(ms));
        }
        metrics.record(Outcome::Timeout, Duration::from_secs(30));

        let avg = metrics.average_latency_ms().unwrap();
        assert!((avg - 25.0).abs() < 0.01);

        let snap = metrics.snapshot(WINDOW);
        assert!((snap.p50_response_ms.unwrap() - 20.0).abs() < 0.01);
        assert!((snap.p99_response_ms.unwrap() - 40.0).abs() < 0.01);
    }

    #[test]
    fn test_concurrent_access() {
        let metrics = Arc::new(PeerMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..250 {
                        let _guard = m.begin_request();
                        m.record(Outcome::Success, Duration::from_micros(5));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let snap = metrics.snapshot(WINDOW);
        assert_eq!(snap.total_requests, 1000);
        assert_eq!(snap.active_requests, 0);
    }

    #[test]
    fn test_probe_updates_last_check() {
        let metrics = PeerMetrics::new();
        assert!(metrics.last_health_check().is_none());
        metrics.record_probe(false);
        assert!(metrics.last_health_check().is_some());
        assert_eq!(metrics.snapshot(WINDOW).probe_failures, 1);
    }
}
