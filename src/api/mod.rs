// Gateway API module
// HTTP surface of the 11-11 dashboards: cost/budget tracking and the AI gateway

pub mod auth;
pub mod handlers;
pub mod types;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::config::GatewayConfig;
use crate::llm::cost::CostAccountant;
use crate::llm::router::LLMRouter;
use crate::storage::{open_stores, GatewayLogStore};
use crate::{GatewayError, Result};
use auth::AuthConfig;
use handlers::{
    cost_trends, gateway_config, gateway_metrics, get_budget, health_check, list_logs, not_found, provider_health,
    provider_stats, route_request, track_cost, GatewayApiState,
};

/// Gateway API server configuration
#[derive(Clone, Debug)]
pub struct GatewayApiConfig {
    pub port: u16,
    pub host: String,
    pub cors_enabled: bool,
}

impl Default for GatewayApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_enabled: true,
        }
    }
}

/// Gateway API Server
pub struct GatewayApiServer {
    config: GatewayApiConfig,
    state: GatewayApiState,
}

impl GatewayApiServer {
    pub fn new(config: GatewayApiConfig, state: GatewayApiState) -> Self {
        Self { config, state }
    }

    /// Wire a complete server from loaded configuration
    ///
    /// Fails when the static tables are inconsistent or storage cannot be opened.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let (registry, table) = config.build_tables()?;
        let stores = open_stores(config.database.url.as_deref()).await?;

        let accountant = Arc::new(CostAccountant::new(stores.costs.clone(), config.budget.clone()));
        let router = LLMRouter::new(
            Arc::new(table),
            Arc::new(registry),
            config.routing.retry.clone(),
            stores.logs.clone(),
        )
        .with_accountant(accountant.clone());

        GatewayApiServerBuilder::new()
            .with_host(config.server.host.clone())
            .with_port(config.server.port)
            .with_cors(config.server.cors_enabled)
            .with_auth(AuthConfig::from(&config.auth))
            .with_llm_router(router)
            .with_accountant(accountant)
            .with_log_store(stores.logs)
            .build()
    }

    pub fn config(&self) -> &GatewayApiConfig {
        &self.config
    }

    pub fn state(&self) -> &GatewayApiState {
        &self.state
    }

    /// Create the Axum router with all gateway routes
    pub fn create_router(&self) -> Router {
        let api_router = Router::new()
            .route("/health", get(health_check))
            // Cost and budget
            .route("/cost/budget", get(get_budget))
            .route("/cost/track", post(track_cost))
            .route("/cost/trends", get(cost_trends))
            // Gateway
            .route("/gateway/route", post(route_request))
            .route("/gateway/logs", get(list_logs))
            .route("/gateway/metrics", get(gateway_metrics))
            .route("/gateway/providers", get(provider_stats))
            .route("/gateway/providers/health", get(provider_health))
            .route("/gateway/config", get(gateway_config))
            .fallback(not_found)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            api_router.layer(CorsLayer::permissive())
        } else {
            api_router
        }
    }

    /// Run the server
    pub async fn run(self) -> anyhow::Result<()> {
        let app = self.create_router();
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("11-11 gateway API starting on http://{}", addr);
        info!("   GET  /cost/budget  POST /cost/track  GET /cost/trends");
        info!("   POST /gateway/route  GET /gateway/logs  GET /gateway/metrics");
        info!("   GET  /gateway/providers  GET /gateway/providers/health  GET /gateway/config");
        info!("   CORS enabled: {}", self.config.cors_enabled);
        info!("   Dev mode: {}", self.state.auth.dev_mode);

        axum::Server::bind(&addr.parse()?)
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }
}

/// Builder pattern for the gateway API server
pub struct GatewayApiServerBuilder {
    config: GatewayApiConfig,
    auth: AuthConfig,
    llm_router: Option<LLMRouter>,
    accountant: Option<Arc<CostAccountant>>,
    logs: Option<Arc<dyn GatewayLogStore>>,
}

impl GatewayApiServerBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayApiConfig::default(),
            auth: AuthConfig::default(),
            llm_router: None,
            accountant: None,
            logs: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.config.host = host;
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_llm_router(mut self, router: LLMRouter) -> Self {
        self.llm_router = Some(router);
        self
    }

    pub fn with_accountant(mut self, accountant: Arc<CostAccountant>) -> Self {
        self.accountant = Some(accountant);
        self
    }

    pub fn with_log_store(mut self, logs: Arc<dyn GatewayLogStore>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn build(self) -> Result<GatewayApiServer> {
        let missing = |part: &str| GatewayError::Config(format!("gateway API server needs {}", part));

        let state = GatewayApiState {
            router: Arc::new(self.llm_router.ok_or_else(|| missing("an LLM router"))?),
            accountant: self.accountant.ok_or_else(|| missing("a cost accountant"))?,
            logs: self.logs.ok_or_else(|| missing("a gateway log store"))?,
            auth: Arc::new(self.auth),
        };
        Ok(GatewayApiServer::new(self.config, state))
    }
}

impl Default for GatewayApiServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
