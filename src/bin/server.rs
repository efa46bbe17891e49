// 11-11 Gateway - HTTP server
// Serves the cost/budget and gateway endpoints used by the dashboards
// Run with: cargo run --bin server

//! # Gateway Server Binary
//!
//! Loads configuration, validates the provider and routing tables, opens
//! storage and serves the API:
//!
//! ```text
//! main()
//!   ↓ loads
//! GatewayConfig (embedded defaults → file → GATEWAY_* env)
//!   ↓ builds
//! GatewayApiServer (router, cost accountant, log store)
//!   ↓ serves
//! axum HTTP server
//! ```
//!
//! An inconsistent routing table stops the process before it binds a port.

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use eleven_gateway::{GatewayApiServer, GatewayConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eleven-gateway")]
#[command(about = "11-11 AI gateway: task-based routing with fallback and cost accounting")]
#[command(version)]
struct Args {
    /// Configuration file layered over the built-in defaults
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; deployments set variables directly
    let dotenv_result = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = dotenv_result {
        warn!("No .env file loaded: {}", e);
    }

    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("Starting 11-11 gateway");
    info!("Providers: {}", config.providers.iter().map(|p| p.id.as_str()).collect::<Vec<_>>().join(", "));
    info!("Routing rules: {}", config.routing.rules.len());
    for provider in &config.providers {
        if let Some(var) = &provider.api_key_env {
            if std::env::var(var).is_ok() {
                info!("API key for {} configured", provider.id);
            }
        }
    }

    let server = GatewayApiServer::from_config(&config)
        .await
        .context("Failed to initialise gateway")?;
    server.run().await
}
