use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventBus, HubEvent};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("info"),
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

/// Condition an alert reports; together with the server it forms the dedup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    HighErrorRate,
    SlowResponses,
    ConsecutiveFailures,
    UnhealthyServers,
    RecoveryExhausted,
}

/// Thresholds the health monitor compares metrics against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Error rate over the monitoring window, in percent
    #[serde(default = "default_error_rate_percent")]
    pub error_rate_percent: f64,

    /// Average response time in milliseconds
    #[serde(default = "default_response_time_ms")]
    pub response_time_ms: u64,

    /// Share of failed servers, in percent
    #[serde(default = "default_unhealthy_server_percent")]
    pub unhealthy_server_percent: f64,

    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,
}

fn default_error_rate_percent() -> f64 {
    50.0
}

fn default_response_time_ms() -> u64 {
    5000
}

fn default_unhealthy_server_percent() -> f64 {
    50.0
}

fn default_consecutive_failures() -> u32 {
    5
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate_percent: default_error_rate_percent(),
            response_time_ms: default_response_time_ms(),
            unhealthy_server_percent: default_unhealthy_server_percent(),
            consecutive_failures: default_consecutive_failures(),
        }
    }
}

/// An emitted alert. Never mutated after emission.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub severity: Severity,
    pub condition: AlertCondition,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Component that raised the alert
    pub component: String,
    pub server: Option<String>,
}

/// A condition that is currently breaching
#[derive(Debug, Clone, Serialize)]
pub struct ActiveAlert {
    /// The alert emitted when the condition first breached
    pub alert: Alert,
    /// Breaches observed since then, including the first
    pub occurrences: u64,
    pub last_seen: DateTime<Utc>,
}

type AlertKey = (AlertCondition, Option<String>);

#[derive(Default)]
struct AlertState {
    active: HashMap<AlertKey, ActiveAlert>,
    recent: VecDeque<Alert>,
}

/// Deduplicating alert sink with a bounded recent-alerts buffer
pub struct AlertManager {
    state: Mutex<AlertState>,
    max_alerts: usize,
    events: EventBus,
}

impl AlertManager {
    pub fn new(max_alerts: usize, events: EventBus) -> Self {
        Self {
            state: Mutex::new(AlertState::default()),
            max_alerts: max_alerts.max(1),
            events,
        }
    }

    /// Report that `condition` is breaching.
    ///
    /// Emits and returns a new alert only when the condition was not already
    /// active for this server; otherwise the active record is updated.
    pub fn raise(
        &self,
        condition: AlertCondition,
        severity: Severity,
        component: &str,
        server: Option<&str>,
        message: impl Into<String>,
    ) -> Option<Alert> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };

        let key = (condition, server.map(str::to_string));
        let now = Utc::now();

        if let Some(active) = state.active.get_mut(&key) {
            active.occurrences += 1;
            active.last_seen = now;
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            severity,
            condition,
            message: message.into(),
            timestamp: now,
            component: component.to_string(),
            server: key.1.clone(),
        };

        match severity {
            Severity::Info => info!(
                server = ?alert.server,
                condition = ?condition,
                "{}", alert.message
            ),
            _ => warn!(
                server = ?alert.server,
                condition = ?condition,
                severity = %severity,
                "{}", alert.message
            ),
        }

        state.active.insert(
            key,
            ActiveAlert {
                alert: alert.clone(),
                occurrences: 1,
                last_seen: now,
            },
        );
        if state.recent.len() == self.max_alerts {
            state.recent.pop_front();
        }
        state.recent.push_back(alert.clone());

        self.events.publish(HubEvent::Alert(alert.clone()));
        Some(alert)
    }

    /// The condition stopped breaching; a later breach raises a fresh alert
    pub fn resolve(&self, condition: AlertCondition, server: Option<&str>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let resolved = state
            .active
            .remove(&(condition, server.map(str::to_string)))
            .is_some();
        if resolved {
            info!(server = ?server, condition = ?condition, "alert condition cleared");
        }
        resolved
    }

    /// Drop every active condition for a server
    pub fn resolve_server(&self, server: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .active
                .retain(|(_, s), _| s.as_deref() != Some(server));
        }
    }

    /// Recently emitted alerts, oldest first
    pub fn recent(&self) -> Vec<Alert> {
        self.state
            .lock()
            .map(|s| s.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Conditions currently breaching
    pub fn active(&self) -> Vec<ActiveAlert> {
        let mut active: Vec<ActiveAlert> = self
            .state
            .lock()
            .map(|s| s.active.values().cloned().collect())
            .unwrap_or_default();
        active.sort_by_key(|a| a.alert.timestamp);
        active
    }

    pub fn is_active(&self, condition: AlertCondition, server: Option<&str>) -> bool {
        self.state
            .lock()
            .map(|s| s.active.contains_key(&(condition, server.map(str::to_string))))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_breach_is_deduplicated() {
        let events = EventBus::new(16);
        let mut sub = events.subscribe();
        let alerts = AlertManager::new(10, events);

        let first = alerts.raise(
            AlertCondition::HighErrorRate,
            Severity::Warning,
            "health_monitor",
            Some("fs"),
            "error rate 80%",
        );
        assert!(first.is_some());

        let second = alerts.raise(
            AlertCondition::HighErrorRate,
            Severity::Warning,
            "health_monitor",
            Some("fs"),
            "error rate 85%",
        );
        assert!(second.is_none());

        assert_eq!(alerts.recent().len(), 1);
        assert_eq!(alerts.active()[0].occurrences, 2);
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn test_same_condition_different_servers() {
        let alerts = AlertManager::new(10, EventBus::new(4));
        alerts.raise(AlertCondition::SlowResponses, Severity::Warning, "m", Some("a"), "slow");
        alerts.raise(AlertCondition::SlowResponses, Severity::Warning, "m", Some("b"), "slow");
        assert_eq!(alerts.recent().len(), 2);
    }

    #[test]
    fn test_resolve_allows_fresh_alert() {
        let alerts = AlertManager::new(10, EventBus::new(4));
        alerts.raise(AlertCondition::UnhealthyServers, Severity::Critical, "m", None, "down");
        assert!(alerts.is_active(AlertCondition::UnhealthyServers, None));

        assert!(alerts.resolve(AlertCondition::UnhealthyServers, None));
        assert!(!alerts.resolve(AlertCondition::UnhealthyServers, None));

        let again = alerts.raise(AlertCondition::UnhealthyServers, Severity::Critical, "m", None, "down");
        assert!(again.is_some());
        assert_eq!(alerts.recent().len(), 2);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let alerts = AlertManager::new(3, EventBus::new(4));
        for i in 0..5 {
            let server = format!("s{i}");
            alerts.raise(AlertCondition::ConsecutiveFailures, Severity::Critical, "m", Some(&server), "x");
        }
        let recent = alerts.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].server.as_deref(), Some("s2"));
        assert_eq!(recent[2].server.as_deref(), Some("s4"));
    }

    #[test]
    fn test_resolve_server() {
        let alerts = AlertManager::new(10, EventBus::new(4));
        alerts.raise(AlertCondition::SlowResponses, Severity::Warning, "m", Some("a"), "slow");
        alerts.raise(AlertCondition::HighErrorRate, Severity::Warning, "m", Some("a"), "errors");
        alerts.resolve_server("a");
        assert!(alerts.active().is_empty());
        // History is kept
        assert_eq!(alerts.recent().len(), 2);
    }

    #[test]
    fn test_alert_serialization() {
        let alerts = AlertManager::new(10, EventBus::new(4));
        let alert = alerts
            .raise(AlertCondition::RecoveryExhausted, Severity::Critical, "recovery", Some("db"), "gave up")
            .unwrap();
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["condition"], "recovery_exhausted");
        assert_eq!(json["server"], "db");
    }
}
