//! 11-11 Gateway Admin CLI
//!
//! Inspects configuration and stored usage without starting the server:
//! validates the routing table, resolves task types, reports budgets and
//! gateway metrics from the configured database, and signs dev tokens.

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use eleven_gateway::api::auth::AuthConfig;
use eleven_gateway::llm::gateway_log::StatusFilter;
use eleven_gateway::storage::open_stores;
use eleven_gateway::{CostAccountant, GatewayConfig, GatewayLogStore, LogFilters, TimeRange};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "eleven-gateway-admin")]
#[command(about = "11-11 gateway admin CLI - inspect routing, budgets and gateway logs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file layered over the built-in defaults
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate providers, routing rules and budget
    ValidateConfig,

    /// Print the routing table
    Routes,

    /// Show which rule a task type resolves to
    Resolve {
        /// Task type as sent by clients
        task_type: String,
    },

    /// List providers, models and pricing
    Providers,

    /// Budget status of a user
    Budget {
        user_id: String,

        #[arg(long)]
        session_id: Option<String>,
    },

    /// Daily usage of a user
    Trends {
        user_id: String,

        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Most recent gateway log records
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        provider: Option<String>,

        /// success or error
        #[arg(long)]
        status: Option<String>,
    },

    /// Aggregated gateway metrics and per-provider stats
    Metrics {
        /// 1h, 24h, 7d or 30d
        #[arg(long, default_value = "24h")]
        range: String,
    },

    /// Sign a bearer token for a user
    Token {
        user_id: String,

        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenv::dotenv().ok();
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = GatewayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ValidateConfig => {
            let (registry, table) = config.build_tables()?;
            info!(
                "Configuration OK: {} providers, {} routing rules",
                registry.len(),
                table.len()
            );
        }

        Commands::Routes => {
            let (_, table) = config.build_tables()?;
            println!("{:<22} {:<32} {:<32}", "TASK TYPE", "PRIMARY", "FALLBACK");
            for rule in table.rules() {
                println!(
                    "{:<22} {:<32} {:<32}",
                    rule.task_type.as_str(),
                    rule.primary.to_string(),
                    rule.fallback.to_string()
                );
            }
        }

        Commands::Resolve { task_type } => {
            let (_, table) = config.build_tables()?;
            let rule = table.resolve(&task_type);
            if rule.task_type.as_str() != task_type.trim() {
                warn!("'{}' is not a known task type, using '{}'", task_type, rule.task_type);
            }
            println!("{}", serde_json::to_string_pretty(rule)?);
        }

        Commands::Providers => {
            let (registry, _) = config.build_tables()?;
            for provider in registry.providers() {
                println!("{} ({}) {}", provider.id, provider.name, provider.base_url);
                for model in &provider.models {
                    match provider.pricing_for(model) {
                        Some(p) => println!(
                            "  {:<24} in ${}/1k  out ${}/1k",
                            model, p.input_cost_per_1k, p.output_cost_per_1k
                        ),
                        None => println!("  {:<24} no pricing", model),
                    }
                }
            }
        }

        Commands::Budget { user_id, session_id } => {
            let stores = open_configured_stores(&config).await?;
            let accountant = CostAccountant::new(stores.costs, config.budget.clone());
            let status = accountant
                .check_budget(&user_id, session_id.as_deref(), Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Trends { user_id, days } => {
            if !(1..=365).contains(&days) {
                bail!("--days must be between 1 and 365");
            }
            let stores = open_configured_stores(&config).await?;
            let accountant = CostAccountant::new(stores.costs, config.budget.clone());
            for day in accountant.daily_trends(&user_id, days, Utc::now()).await? {
                println!("{}  {:>10} tokens  ${:.4}", day.date, day.total_tokens, day.total_cost);
            }
        }

        Commands::Logs { limit, provider, status } => {
            let stores = open_configured_stores(&config).await?;
            let filters = LogFilters {
                provider_id: provider,
                status: status.as_deref().map(StatusFilter::from_str).transpose()?,
                ..Default::default()
            };
            for log in stores.logs.recent_logs(limit, 0, &filters).await? {
                println!(
                    "{}  {:<10} {:<20} {:>3} {:>6}ms ${:.5} {}",
                    log.created_at.format("%Y-%m-%d %H:%M:%S"),
                    log.provider_id,
                    log.model_id,
                    log.status_code,
                    log.latency_ms,
                    log.cost_usd,
                    log.error_message.unwrap_or_default()
                );
            }
        }

        Commands::Metrics { range } => {
            let range = TimeRange::from_str(&range)?;
            let stores = open_configured_stores(&config).await?;
            let metrics = stores.logs.aggregated_metrics(range).await?;
            let providers = stores.logs.provider_stats(range).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "range": range.as_str(),
                    "metrics": metrics,
                    "providers": providers,
                }))?
            );
        }

        Commands::Token { user_id, hours } => {
            let auth = AuthConfig::from(&config.auth);
            println!("{}", auth.issue_token(&user_id, Duration::hours(hours))?);
        }
    }

    Ok(())
}

async fn open_configured_stores(config: &GatewayConfig) -> Result<eleven_gateway::storage::Stores> {
    if config.database.url.is_none() {
        warn!("No database.url configured; reading from an empty in-memory store");
    }
    Ok(open_stores(config.database.url.as_deref()).await?)
}
