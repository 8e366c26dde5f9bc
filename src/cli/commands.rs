use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::ResilienceManager;
use crate::events::HubEvent;
use crate::lb::health::SystemStatus;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{out}");
    Ok(())
}

/// Parse `--args`; no arguments means an empty object
pub fn parse_arguments(raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--args is not valid JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

/// Print system status plus per-server metrics
pub async fn cmd_status(hub: &ResilienceManager) -> Result<()> {
    let metrics = hub.get_metrics().await;
    print_json(&json!({
        "status": metrics.system,
        "totals": metrics.totals,
        "servers": metrics.servers,
        "alerts": hub.active_alerts(),
    }))
}

/// Print the aggregated tools, or resources
pub async fn cmd_tools(hub: &ResilienceManager, resources: bool) -> Result<()> {
    let entries = if resources {
        hub.get_aggregated_resources().await
    } else {
        hub.get_aggregated_tools().await
    };
    print_json(&entries)
}

/// Call one namespaced tool
pub async fn cmd_call(hub: &ResilienceManager, tool: &str, args: Option<&str>) -> Result<()> {
    let arguments = parse_arguments(args)?;
    debug!(tool = %tool, "Calling tool");

    match hub.call_tool(tool, arguments).await {
        Ok(result) => print_json(&result),
        Err(e) => {
            print_json(&json!({ "error": e.to_payload() }))?;
            Err(e).context(format!("Tool call '{tool}' failed"))
        }
    }
}

/// Read one namespaced resource
pub async fn cmd_read(hub: &ResilienceManager, uri: &str) -> Result<()> {
    match hub.read_resource(uri).await {
        Ok(result) => print_json(&result),
        Err(e) => {
            print_json(&json!({ "error": e.to_payload() }))?;
            Err(e).context(format!("Reading resource '{uri}' failed"))
        }
    }
}

fn log_status(status: &SystemStatus) {
    info!(
        total = status.total_servers,
        healthy = status.healthy_servers,
        degraded = status.degraded_servers,
        failed = status.failed_servers,
        recoveries = status.active_recoveries,
        queue = status.queue_size,
        "Hub status"
    );
}

/// Run the background loops until Ctrl-C, printing alerts as JSON lines
pub async fn cmd_run(hub: &ResilienceManager) -> Result<()> {
    hub.start();
    let mut events = hub.subscribe();

    let interval = Duration::from_millis(hub.config.monitoring.metrics_interval_ms);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    log_status(&hub.get_system_status().await);
    info!("Hub running, press Ctrl-C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                log_status(&hub.get_system_status().await);
            }
            event = events.recv() => match event {
                Some(HubEvent::Alert(alert)) => {
                    println!("{}", serde_json::to_string(&alert)?);
                }
                Some(_) => {}
                None => break,
            },
        }
    }
    Ok(())
}
