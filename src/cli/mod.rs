//! Command implementations for the `mcp-hub` binary
//!
//! Every command prints JSON to stdout; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # System status and per-server health
//! mcp-hub --config hub.yaml status
//!
//! # Aggregated catalog
//! mcp-hub --config hub.yaml tools
//! mcp-hub --config hub.yaml tools --resources
//!
//! # Call a namespaced tool
//! mcp-hub --config hub.yaml call fs__read_file --args '{"path": "/etc/hosts"}'
//!
//! # Serve until Ctrl-C, printing alerts as they fire
//! mcp-hub --config hub.yaml run
//! ```

pub mod commands;

pub use commands::{cmd_call, cmd_read, cmd_run, cmd_status, cmd_tools};
