use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod processors;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "flowsmith")]
#[command(about = "Workflow graph validation and execution server", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "flowsmith.toml", env = "FLOWSMITH_CONFIG")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowsmith=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Flowsmith");
    tracing::info!("Configuration file: {}", args.config.display());

    let config = ServerConfig::load(&args.config)?;

    let addr = format!("{}:{}", args.host, args.port);
    api::serve(&addr, config).await?;

    Ok(())
}
