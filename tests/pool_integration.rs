//! Integration tests for peer connections and the circuit breaker
//!
//! These tests verify that the connection lifecycle and circuit breaker
//! work correctly together in realistic scenarios.

mod common;

use common::{Behavior, MockConnector};
use mcp_hub::events::EventBus;
use mcp_hub::pool::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitPhase, CircuitState,
    ConnectionState, Invocation, PeerConnection, PeerConnector, PeerDescriptor,
};
use mcp_hub::{HubError, HubEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn breaker_config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        recovery_timeout: recovery,
        monitoring_window: Duration::from_secs(10),
        max_penalty_multiplier: 8,
        failback_delay: Duration::ZERO,
    }
}

fn connection(connector: &Arc<MockConnector>, name: &str, events: &EventBus) -> PeerConnection {
    PeerConnection::new(
        Arc::new(PeerDescriptor::new(name, "mock-server")),
        Arc::clone(connector) as Arc<dyn PeerConnector>,
        2,
        events.clone(),
    )
}

fn call(tool: &str) -> Invocation {
    Invocation::CallTool {
        name: tool.to_string(),
        arguments: json!({}),
    }
}

#[tokio::test]
async fn test_connection_and_circuit_integration() {
    let connector = MockConnector::new();
    connector.server("files", &["read", "write"]);
    let events = EventBus::new(32);
    let circuit = CircuitBreaker::new(breaker_config(3, Duration::from_millis(500)));

    let conn = connection(&connector, "files", &events);
    let catalog = conn.connect().await.unwrap();
    circuit.register_peer("files").await;

    assert_eq!(catalog.tools.len(), 2);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(circuit.is_healthy("files").await);
    assert!(circuit.check_request("files").await.is_ok());

    let result = conn.invoke(&call("read"), Duration::from_secs(1)).await.unwrap();
    assert_eq!(result["target"], "read");
    circuit.record_success("files").await;

    let stats = circuit.get_stats("files").await.unwrap();
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.phase, CircuitPhase::Closed);
}

#[tokio::test]
async fn test_circuit_opens_after_failures() {
    let circuit = CircuitBreaker::new(breaker_config(3, Duration::from_secs(5)));
    circuit.register_peer("failing").await;

    for _ in 0..2 {
        assert_eq!(circuit.record_failure("failing").await, Some(CircuitPhase::Closed));
    }
    assert_eq!(circuit.record_failure("failing").await, Some(CircuitPhase::Open));

    assert!(!circuit.is_healthy("failing").await);
    match circuit.check_request("failing").await {
        Err(CircuitError::CircuitOpen { retry_in, .. }) => {
            assert!(retry_in <= Duration::from_secs(5));
        }
        other => panic!("expected an open circuit, got {other:?}"),
    }
    assert_eq!(circuit.get_stats("failing").await.unwrap().total_rejections, 1);
}

#[tokio::test]
async fn test_circuit_recovery_flow() {
    let circuit = CircuitBreaker::new(breaker_config(2, Duration::from_millis(50)));
    circuit.register_peer("flaky").await;

    circuit.record_failure("flaky").await;
    circuit.record_failure("flaky").await;
    assert_eq!(circuit.selectable(&["flaky"]).await, vec![false]);

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(circuit.selectable(&["flaky"]).await, vec![true]);

    // Exactly one trial request is let through
    assert!(circuit.check_request("flaky").await.is_ok());
    assert_eq!(circuit.get_phase("flaky").await, Some(CircuitPhase::HalfOpen));
    assert!(matches!(
        circuit.check_request("flaky").await,
        Err(CircuitError::TrialInFlight(_))
    ));

    assert_eq!(circuit.record_success("flaky").await, Some(CircuitPhase::Closed));
    assert!(circuit.is_healthy("flaky").await);
}

#[tokio::test]
async fn test_failed_trial_reopens_with_penalty() {
    let circuit = CircuitBreaker::new(breaker_config(1, Duration::from_millis(40)));
    circuit.register_peer("flaky").await;

    circuit.record_failure("flaky").await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    circuit.check_request("flaky").await.unwrap();
    assert_eq!(circuit.record_failure("flaky").await, Some(CircuitPhase::Open));

    circuit.trip("flaky", true).await;
    let stats = circuit.get_stats("flaky").await.unwrap();
    assert_eq!(stats.penalty_level, 1);
    assert!(stats.retry_in.unwrap() > Duration::from_millis(40));

    // A successful recovery wipes both
    circuit.reset_circuit("flaky").await;
    circuit.clear_penalty("flaky").await;
    assert_eq!(circuit.get_state("flaky").await, Some(CircuitState::Closed));
    assert_eq!(circuit.get_stats("flaky").await.unwrap().penalty_level, 0);
}

#[tokio::test]
async fn test_multiple_peers_are_isolated() {
    let circuit = CircuitBreaker::new(breaker_config(2, Duration::from_secs(5)));
    for peer in ["a", "b", "c"] {
        circuit.register_peer(peer).await;
    }

    circuit.record_failure("b").await;
    circuit.record_failure("b").await;

    assert_eq!(circuit.selectable(&["a", "b", "c"]).await, vec![true, false, true]);
    let all = circuit.get_all_stats().await;
    assert_eq!(all.len(), 3);
    assert_eq!(all["b"].open_count, 1);
    assert_eq!(all["a"].open_count, 0);
}

#[tokio::test]
async fn test_peer_removal() {
    let circuit = CircuitBreaker::new(CircuitBreakerConfig::default());
    circuit.register_peer("gone").await;
    circuit.remove_peer("gone").await;

    assert!(matches!(
        circuit.check_request("gone").await,
        Err(CircuitError::PeerNotFound(_))
    ));
    assert!(circuit.get_stats("gone").await.is_none());
    assert_eq!(circuit.selectable(&["gone"]).await, vec![false]);
}

#[tokio::test]
async fn test_closed_transport_fails_connection_until_recovered() {
    let connector = MockConnector::new();
    let server = connector.server("files", &["read"]);
    let events = EventBus::new(32);
    let mut sub = events.subscribe();
    let conn = connection(&connector, "files", &events);
    conn.connect().await.unwrap();

    server.set_behavior(Behavior::Close);
    let err = conn.invoke(&call("read"), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, HubError::Transport { .. }));
    assert_eq!(conn.state(), ConnectionState::Failed);
    assert!(matches!(
        conn.invoke(&call("read"), Duration::from_secs(1)).await,
        Err(HubError::NotConnected { .. })
    ));

    server.set_behavior(Behavior::Succeed);
    conn.recover(Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(server.connects(), 2);
    // The dead transport was closed before reconnecting
    assert_eq!(server.closes(), 1);

    let states: Vec<ConnectionState> = sub
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            HubEvent::ConnectionStateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Failed,
            ConnectionState::Recovering,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_recover_requires_passing_probe() {
    let connector = MockConnector::new();
    let server = connector.server("files", &["read"]);
    let events = EventBus::new(32);
    let conn = connection(&connector, "files", &events);
    conn.connect().await.unwrap();

    server.fail_pings(true);
    assert!(conn.recover(Some(Duration::from_secs(1))).await.is_err());
    assert_eq!(conn.state(), ConnectionState::Failed);
    // The fresh transport that failed its probe was closed too
    assert_eq!(server.closes(), 2);

    // Without a probe the reconnect alone is enough
    conn.recover(None).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let connector = MockConnector::new();
    let server = connector.server("files", &["read"]);
    let events = EventBus::new(32);
    let conn = connection(&connector, "files", &events);
    conn.connect().await.unwrap();

    conn.disconnect().await;
    conn.disconnect().await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(server.closes(), 1);
    assert!(conn.catalog().tools.is_empty());
}
