use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancing strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through eligible servers in registration order
    #[default]
    #[serde(alias = "ROUND_ROBIN")]
    RoundRobin,
    /// Pick the server with the fewest in-flight requests
    #[serde(alias = "LEAST_CONNECTIONS")]
    LeastConnections,
    /// Pick the server with the lowest average response time
    #[serde(alias = "LEAST_RESPONSE_TIME")]
    LeastResponseTime,
    /// Weighted random by recent success rate
    #[serde(alias = "HEALTH_WEIGHTED")]
    HealthWeighted,
    /// Uniform random
    #[serde(alias = "RANDOM")]
    Random,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::LeastResponseTime => "least_response_time",
            Strategy::HealthWeighted => "health_weighted",
            Strategy::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Strategy::RoundRobin),
            "least_connections" => Ok(Strategy::LeastConnections),
            "least_response_time" => Ok(Strategy::LeastResponseTime),
            "health_weighted" => Ok(Strategy::HealthWeighted),
            "random" => Ok(Strategy::Random),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

/// What the balancer knows about one eligible server
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub name: &'a str,
    /// Requests currently executing against this server
    pub active_requests: u32,
    /// Rolling average response time; `None` before the first sample
    pub avg_latency_ms: Option<f64>,
    /// Recent share of requests answered without a transport fault or
    /// timeout, 0.0..=1.0; `None` before the first sample
    pub success_rate: Option<f64>,
}

impl<'a> Candidate<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            active_requests: 0,
            avg_latency_ms: None,
            success_rate: None,
        }
    }
}

/// Chooses one server among the eligible candidates for a request.
///
/// Candidates are passed in registration order and have already been
/// filtered for circuit and connection state; the balancer only applies the
/// strategy.
pub struct LoadBalancer {
    strategy: Strategy,
    /// Minimum success rate for `HealthWeighted`; lower candidates are excluded
    health_threshold: f64,
    /// Counter for round-robin
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy, health_threshold: f64) -> Self {
        Self {
            strategy,
            health_threshold: health_threshold.clamp(0.0, 1.0),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select a candidate; returns its index, or `None` if none qualifies
    pub fn select(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(candidates),
            Strategy::LeastConnections => Self::select_least_connections(candidates),
            Strategy::LeastResponseTime => Self::select_least_response_time(candidates),
            Strategy::HealthWeighted => self.select_health_weighted(candidates),
            Strategy::Random => Self::select_random(candidates),
        }
    }

    /// Round-robin: simple counter-based selection
    fn select_round_robin(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(index)
    }

    /// Least-connections; `min_by_key` keeps the first minimum, so ties go
    /// to the earliest registered server
    fn select_least_connections(candidates: &[Candidate<'_>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.active_requests)
            .map(|(idx, _)| idx)
    }

    /// Least response time; servers without samples count as zero latency
    fn select_least_response_time(candidates: &[Candidate<'_>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let a = a.avg_latency_ms.unwrap_or(0.0);
                let b = b.avg_latency_ms.unwrap_or(0.0);
                a.total_cmp(&b)
            })
            .map(|(idx, _)| idx)
    }

    /// Weighted random by success rate, excluding servers under the threshold
    fn select_health_weighted(&self, candidates: &[Candidate<'_>]) -> Option<usize> {
        let weighted: Vec<(usize, f64)> = candidates
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx, c.success_rate.unwrap_or(1.0)))
            .filter(|(_, rate)| *rate >= self.health_threshold)
            .collect();

        if weighted.is_empty() {
            return None;
        }

        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            // Threshold of zero admits servers with zero success; pick uniformly
            let pick = rand::thread_rng().gen_range(0..weighted.len());
            return Some(weighted[pick].0);
        }

        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (idx, weight) in &weighted {
            if roll < *weight {
                return Some(*idx);
            }
            roll -= weight;
        }
        weighted.last().map(|(idx, _)| *idx)
    }

    fn select_random(candidates: &[Candidate<'_>]) -> Option<usize> {
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(names: &[&'static str]) -> Vec<Candidate<'static>> {
        names.iter().map(|n| Candidate::new(n)).collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = LoadBalancer::new(Strategy::RoundRobin, 0.5);
        let c = candidates(&["a", "b", "c"]);

        assert_eq!(lb.select(&c), Some(0));
        assert_eq!(lb.select(&c), Some(1));
        assert_eq!(lb.select(&c), Some(2));
        assert_eq!(lb.select(&c), Some(0));
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let lb = LoadBalancer::new(Strategy::LeastConnections, 0.5);
        let mut c = candidates(&["a", "b"]);
        c[0].active_requests = 2;
        c[1].active_requests = 0;

        assert_eq!(lb.select(&c), Some(1));
    }

    #[test]
    fn test_least_connections_tie_goes_to_first() {
        let lb = LoadBalancer::new(Strategy::LeastConnections, 0.5);
        let mut c = candidates(&["a", "b", "c"]);
        c[0].active_requests = 3;
        c[1].active_requests = 1;
        c[2].active_requests = 1;

        assert_eq!(lb.select(&c), Some(1));
    }

    #[test]
    fn test_least_response_time_warm_up() {
        let lb = LoadBalancer::new(Strategy::LeastResponseTime, 0.5);
        let mut c = candidates(&["a", "b", "c"]);
        c[0].avg_latency_ms = Some(12.0);
        c[1].avg_latency_ms = Some(4.0);
        c[2].avg_latency_ms = None;

        // Unsampled server is treated as zero latency
        assert_eq!(lb.select(&c), Some(2));

        c[2].avg_latency_ms = Some(50.0);
        assert_eq!(lb.select(&c), Some(1));
    }

    #[test]
    fn test_health_weighted_excludes_below_threshold() {
        let lb = LoadBalancer::new(Strategy::HealthWeighted, 0.5);
        let mut c = candidates(&["a", "b"]);
        c[0].success_rate = Some(0.2);
        c[1].success_rate = Some(0.9);

        for _ in 0..50 {
            assert_eq!(lb.select(&c), Some(1));
        }

        c[1].success_rate = Some(0.3);
        assert_eq!(lb.select(&c), None);
    }

    #[test]
    fn test_health_weighted_distribution() {
        let lb = LoadBalancer::new(Strategy::HealthWeighted, 0.1);
        let mut c = candidates(&["a", "b"]);
        c[0].success_rate = Some(1.0);
        c[1].success_rate = Some(0.25);

        let picks_a = (0..2000).filter(|_| lb.select(&c) == Some(0)).count();
        // Expected share is 0.8
        assert!(picks_a > 1400 && picks_a < 1800, "picks_a = {picks_a}");
    }

    #[test]
    fn test_random_in_range() {
        let lb = LoadBalancer::new(Strategy::Random, 0.5);
        let c = candidates(&["a", "b", "c", "d"]);
        for _ in 0..100 {
            assert!(lb.select(&c).unwrap() < 4);
        }
    }

    #[test]
    fn test_empty_candidates() {
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastConnections,
            Strategy::LeastResponseTime,
            Strategy::HealthWeighted,
            Strategy::Random,
        ] {
            let lb = LoadBalancer::new(strategy, 0.5);
            assert_eq!(lb.select(&[]), None);
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("ROUND_ROBIN".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("least-connections".parse::<Strategy>().unwrap(), Strategy::LeastConnections);
        assert_eq!("health_weighted".parse::<Strategy>().unwrap(), Strategy::HealthWeighted);
        assert!("fastest".parse::<Strategy>().is_err());

        let parsed: Strategy = serde_yaml::from_str("LEAST_RESPONSE_TIME").unwrap();
        assert_eq!(parsed, Strategy::LeastResponseTime);
    }
}
