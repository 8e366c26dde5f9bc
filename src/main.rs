use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_hub::{cli, config, ResilienceManager};

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(version, about = "Resilient hub for tool and resource servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to MCP_HUB_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show system status and per-server health
    Status,

    /// List the aggregated tools
    Tools {
        /// List resources instead of tools
        #[arg(long)]
        resources: bool,
    },

    /// Call a tool by its namespaced name (server__tool)
    Call {
        /// Namespaced tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },

    /// Read a resource by its namespaced URI (server__uri)
    Read {
        /// Namespaced resource URI
        uri: String,
    },

    /// Run the hub until interrupted
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One-shot commands run on a current_thread runtime; `run` serves
    // concurrent traffic and background loops on a multi_thread one
    let runtime = if matches!(cli.command, Commands::Run) {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    let hub = ResilienceManager::with_stdio(config)?;
    for (server, error) in hub.connect_configured_servers().await {
        warn!(server = %server, error = %error, "Server unavailable");
    }

    let result = match &cli.command {
        Commands::Status => cli::cmd_status(&hub).await,
        Commands::Tools { resources } => cli::cmd_tools(&hub, *resources).await,
        Commands::Call { tool, args } => cli::cmd_call(&hub, tool, args.as_deref()).await,
        Commands::Read { uri } => cli::cmd_read(&hub, uri).await,
        Commands::Run => cli::cmd_run(&hub).await,
    };

    hub.shutdown().await;
    result
}
