//! mcp-hub - resilient routing hub for tool and resource servers

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod lb;
pub mod pool;
pub mod recovery;

pub use crate::core::ResilienceManager;
pub use config::Config;
pub use error::{ErrorKind, HubError, HubResult};
pub use events::{HubEvent, Subscription};
