//! Configuration loading
//!
//! Sources, lowest priority first:
//!
//! 1. `config/default.toml`, embedded at compile time
//! 2. `config/gateway.toml` in the working directory, or the file given with
//!    `--config`
//! 3. `GATEWAY_*` environment variables, `__` between sections
//!    (`GATEWAY_AUTH__JWT_SECRET`, `GATEWAY_SERVER__PORT`)
//!
//! Provider and routing tables are arrays, which config-rs merges index by
//! index. To keep a user's table from being spliced into the built-in one,
//! the built-in tables (`config/routing.toml`) are only applied when the
//! loaded configuration declares none.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::llm::cost::Budget;
use crate::llm::registry::{ProviderConfig, ProviderRegistry};
use crate::llm::routing::{RetryPolicy, RoutingRule, RoutingTable};
use crate::GatewayError;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Built-in provider and routing tables
pub const DEFAULT_TABLES: &str = include_str!("../config/routing.toml");

const ENV_PREFIX: &str = "GATEWAY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors_enabled: bool,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HS256 secret for bearer tokens
    #[serde(default, skip_serializing)]
    pub jwt_secret: Option<String>,
    /// Accept requests without credentials as `dev_user_id`
    #[serde(default)]
    pub dev_mode: bool,
    pub dev_user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL; `None` keeps everything in memory
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthSettings,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub budget: Budget,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Deserialize)]
struct DefaultTables {
    providers: Vec<ProviderConfig>,
    routing: DefaultRules,
}

#[derive(Debug, Deserialize)]
struct DefaultRules {
    rules: Vec<RoutingRule>,
}

impl GatewayConfig {
    /// Load from embedded defaults, an optional file and the environment
    ///
    /// Without `path`, `config/gateway.toml` is read when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("config/gateway").required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let loaded: GatewayConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.with_default_tables()
    }

    /// Parse an override document layered on the embedded defaults
    ///
    /// The environment is not consulted.
    pub fn from_toml_str(overrides: &str) -> Result<Self> {
        let loaded: GatewayConfig = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.with_default_tables()
    }

    fn with_default_tables(mut self) -> Result<Self> {
        if !self.providers.is_empty() && !self.routing.rules.is_empty() {
            return Ok(self);
        }

        let defaults: DefaultTables = Config::builder()
            .add_source(File::from_str(DEFAULT_TABLES, FileFormat::Toml))
            .build()
            .context("Failed to build built-in routing tables")?
            .try_deserialize()
            .context("Failed to deserialize built-in routing tables")?;

        if self.providers.is_empty() {
            debug!("Using built-in provider table");
            self.providers = defaults.providers;
        }
        if self.routing.rules.is_empty() {
            debug!("Using built-in routing rules");
            self.routing.rules = defaults.routing.rules;
        }
        Ok(self)
    }

    /// Validate the static tables and build them
    ///
    /// Fails on the first inconsistency so a bad deployment never starts.
    pub fn build_tables(&self) -> crate::Result<(ProviderRegistry, RoutingTable)> {
        self.budget.validate()?;
        if self.routing.retry.timeout_ms == 0 {
            return Err(GatewayError::Config("routing.retry.timeout_ms must be positive".to_string()));
        }
        if !self.auth.dev_mode && self.auth.jwt_secret.as_deref().map_or(true, str::is_empty) {
            tracing::warn!("No JWT secret configured and dev mode disabled; every authenticated call will be rejected");
        }

        let registry = ProviderRegistry::new(self.providers.clone())?;
        let table = RoutingTable::from_rules(self.routing.rules.clone(), &registry)?;
        Ok((registry, table))
    }
}
