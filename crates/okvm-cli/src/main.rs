//! The `okvm` binary.

mod config;

use clap::{Parser, Subcommand};
use config::OkvmConfig;
use okvm_agent::{OpenAiCompatClient, TurnExecutor};
use okvm_gateway::GatewayServer;
use okvm_session::{open_conversation_store, SessionStore};
use okvm_workspace::WorkspaceManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "okvm", about = "okvm: sandboxed agent workspaces over HTTP")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "okvm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate the config and print the resolved settings
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = OkvmConfig::load(&cli.config).await?;
    config.validate()?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await?;
        }
        Commands::Check => {
            let has_key = config.model.resolved_api_key().is_some();
            if config.model.api_key.is_some() {
                config.model.api_key = Some("<redacted>".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            if !has_key {
                println!("\nwarning: no model API key (set model.api_key or OKVM_API_KEY)");
            }
        }
    }

    Ok(())
}

async fn serve(config: OkvmConfig) -> anyhow::Result<()> {
    if config.model.resolved_api_key().is_none() {
        warn!("No model API key configured; model calls may be rejected");
    }

    let workspaces = Arc::new(WorkspaceManager::new(config.workspace)?);
    let conversations = open_conversation_store(&config.conversations).await?;
    let model = Arc::new(OpenAiCompatClient::new(config.model));
    let executor = Arc::new(TurnExecutor::new(model, config.executor));
    let sessions = Arc::new(SessionStore::new(
        workspaces,
        executor,
        conversations,
        config.session,
    ));

    let shutdown = CancellationToken::new();
    let sweeper = sessions.spawn_sweeper(shutdown.clone());
    let app = GatewayServer::build(Arc::clone(&sessions));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("okvm gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }
    let evicted = sessions.evict_all().await;
    info!(evicted, "All sessions released");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
