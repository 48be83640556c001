use anyhow::Result;
use clap::Parser;
use fleetlink_mcp::McpServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod websocket;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(about = "Fleet master: slave links, tool proxy and admin API", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fleetlink.toml", env = "FLEETLINK_CONFIG")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "FLEETLINK_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Serve slave links on a separate port instead of the API port
    #[arg(long)]
    link_port: Option<u16>,

    /// Also serve MCP over stdin/stdout
    #[arg(long)]
    mcp_stdio: bool,

    /// Context used to filter tools served over stdio
    #[arg(long, requires = "mcp_stdio")]
    mcp_context: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the MCP transport when --mcp-stdio is set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetlink=info,tower_http=debug".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting fleetlink master");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    let state = Arc::new(AppState::new(&config)?);
    let handle = state.manager.start()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    if args.mcp_stdio {
        let mut server = McpServer::new(state.proxy.clone());
        if let Some(context) = args.mcp_context {
            server = server.with_context(context);
        }
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run_stdio().await {
                tracing::error!("MCP stdio server failed: {:#}", e);
            }
            // stdin closed: the client is gone
            shutdown.cancel();
        });
    }

    let addr = format!("{}:{}", args.host, args.port);
    let served = match args.link_port {
        Some(link_port) => {
            let link_addr = format!("{}:{}", args.host, link_port);
            tokio::try_join!(
                api::serve(&addr, api::create_admin_router(state.clone()), shutdown.clone().cancelled_owned()),
                api::serve(&link_addr, api::create_link_router(state.clone()), shutdown.clone().cancelled_owned()),
            )
            .map(|_| ())
        }
        None => api::serve(&addr, api::create_router(state.clone()), shutdown.clone().cancelled_owned()).await,
    };

    state.manager.stop();
    handle.join().await;
    tracing::info!("Fleetlink master stopped");

    served
}
