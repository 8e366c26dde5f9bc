use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ProbationEntry {
    /// Times the router considered this server while on probation
    considered: u64,
    /// Successes in a row since probation started
    streak: u32,
}

/// Tracks recovered servers that only get a capped share of traffic.
///
/// A server on probation is eligible on every `share`-th selection in which
/// it is a candidate, unless it is the only candidate. After `success_streak`
/// successes in a row it is promoted back to full eligibility.
pub struct ProbationTracker {
    entries: Mutex<HashMap<String, ProbationEntry>>,
    share: u64,
    success_streak: u32,
}

impl ProbationTracker {
    pub fn new(share: u32, success_streak: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            share: u64::from(share.max(1)),
            success_streak: success_streak.max(1),
        }
    }

    /// Put a server on probation, restarting its streak
    pub fn start(&self, server: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(server.to_string(), ProbationEntry::default());
            info!(server = %server, share = self.share, "Server on probation");
        }
    }

    pub fn is_on_probation(&self, server: &str) -> bool {
        self.entries
            .lock()
            .map(|e| e.contains_key(server))
            .unwrap_or(false)
    }

    /// Whether `server` may be selected this time. Servers not on probation
    /// are always admitted.
    pub fn admit(&self, server: &str, sole_candidate: bool) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return true;
        };
        let Some(entry) = entries.get_mut(server) else {
            return true;
        };
        if sole_candidate {
            return true;
        }
        entry.considered += 1;
        entry.considered % self.share == 0
    }

    /// Record a success; returns true when this promotes the server
    pub fn record_success(&self, server: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let Some(entry) = entries.get_mut(server) else {
            return false;
        };
        entry.streak += 1;
        debug!(server = %server, streak = entry.streak, "Probation success");
        if entry.streak >= self.success_streak {
            entries.remove(server);
            info!(server = %server, "Server promoted from probation");
            return true;
        }
        false
    }

    /// Record a failure; returns true when the server was on probation
    /// (and is now off it, pending another recovery)
    pub fn record_failure(&self, server: &str) -> bool {
        let removed = self
            .entries
            .lock()
            .map(|mut e| e.remove(server).is_some())
            .unwrap_or(false);
        if removed {
            warn!(server = %server, "Failure during probation");
        }
        removed
    }

    pub fn remove(&self, server: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(server);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_share() {
        let tracker = ProbationTracker::new(3, 5);
        tracker.start("a");

        let admitted: Vec<bool> = (0..6).map(|_| tracker.admit("a", false)).collect();
        assert_eq!(admitted, vec![false, false, true, false, false, true]);

        // Unknown servers are not restricted
        assert!(tracker.admit("b", false));
    }

    #[test]
    fn test_sole_candidate_always_admitted() {
        let tracker = ProbationTracker::new(10, 5);
        tracker.start("a");
        assert!(tracker.admit("a", true));
        assert!(tracker.admit("a", true));
    }

    #[test]
    fn test_promotion_after_streak() {
        let tracker = ProbationTracker::new(2, 3);
        tracker.start("a");

        assert!(!tracker.record_success("a"));
        assert!(!tracker.record_success("a"));
        assert!(tracker.record_success("a"));
        assert!(!tracker.is_on_probation("a"));
        assert!(!tracker.record_success("a"));
    }

    #[test]
    fn test_failure_ends_probation() {
        let tracker = ProbationTracker::new(2, 3);
        tracker.start("a");
        tracker.record_success("a");

        assert!(tracker.record_failure("a"));
        assert!(!tracker.record_failure("a"));
        assert!(tracker.is_empty());
    }
}
