// 11-11 Gateway - Rust Edition
// Routing, fallback and cost accounting core behind the 11-11 dashboards

//! # 11-11 Gateway Library
//!
//! This is the library crate behind the 11-11 AI gateway. It owns the pieces of
//! the product that carry real decision logic and exposes them to the HTTP
//! server and the admin CLI found under `src/bin/`.
//!
//! ## Core Components
//!
//! ### Routing
//! - [`RoutingTable`]: validated, immutable map from task type to a primary and
//!   a fallback provider/model pair. The `default` rule is mandatory.
//! - [`ProviderRegistry`]: the upstream providers and the models they serve.
//! - [`LLMRouter`]: runs a request through the failure/fallback protocol
//!   (sequential retries on the primary, one attempt on the fallback).
//! - [`HealthTracker`]: per-provider circuit breaker fed by the router.
//!
//! ### Accounting
//! - [`CostAccountant`]: validates and records billable usage, aggregates it by
//!   session and calendar month, and raises budget warnings.
//!
//! ### Gateway logs
//! - [`GatewayLogRecord`]: one immutable record per upstream attempt.
//! - [`GatewayLogStore`]: append-only store with dashboard queries.
//!
//! ### API
//! The [`api`] module wires everything into an axum router. Every handler
//! receives an explicit [`AuthContext`] instead of reading process-wide flags.
//!
//! ## Layering
//!
//! ```text
//! api (axum handlers, AuthContext)
//!   ↓
//! llm (router, routing table, cost accountant)
//!   ↓
//! storage (in-memory or SQLite)
//! ```

// Configuration loading (embedded defaults, files, environment)
pub mod config;

// Routing, providers, cost accounting and gateway logs
pub mod llm;

// Persistence backends for usage records and gateway logs
pub mod storage;

// HTTP surface used by the dashboards
pub mod api;

pub use config::GatewayConfig;

pub use llm::{
    cost::{Budget, BudgetStatus, BudgetWarning, CostAccountant, CostRecord, OperationType},
    gateway_log::{AggregatedMetrics, GatewayLogRecord, LogFilters, ProviderStats, TimeRange},
    health::HealthTracker,
    registry::{ProviderConfig, ProviderRegistry},
    router::LLMRouter,
    routing::{ModelRef, RetryPolicy, RoutingRule, RoutingTable},
    LLMError, LLMRequest, LLMResponse, TaskType,
};

pub use storage::{CostStore, GatewayLogStore, InMemoryStore, SqliteStore};

pub use api::{auth::AuthContext, GatewayApiServer, GatewayApiServerBuilder};

use thiserror::Error;

/// Error taxonomy shared by the library and the API boundary
///
/// Each variant maps onto exactly one HTTP status code (see
/// [`GatewayError::status_code`]). Only 4xx messages are shown verbatim to API
/// callers; everything else is replaced by [`GatewayError::client_message`].
/// `GatewayUnavailable` carries upstream error text, which can quote provider
/// response bodies.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or missing input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing or invalid caller identity
    #[error("Authentication required: {0}")]
    Auth(String),

    /// Caller identity does not match the requested resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream or local quota exhausted
    #[error("Rate limited: {0}")]
    RateLimit(String),

    /// Every routing attempt failed, primary and fallback alike
    #[error("Gateway unavailable: primary failed ({primary}); fallback failed ({fallback})")]
    GatewayUnavailable { primary: String, fallback: String },

    /// Static configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code for this error class
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Auth(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::RateLimit(_) => 429,
            GatewayError::GatewayUnavailable { .. } => 503,
            GatewayError::Config(_)
            | GatewayError::Storage(_)
            | GatewayError::Serialization(_)
            | GatewayError::Internal(_) => 500,
        }
    }

    /// Machine-readable error type used in API error bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request_error",
            GatewayError::Auth(_) => "authentication_error",
            GatewayError::Forbidden(_) => "permission_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::RateLimit(_) => "rate_limit_error",
            GatewayError::GatewayUnavailable { .. } => "gateway_unavailable",
            _ => "internal_error",
        }
    }

    /// Whether the message is safe to show to API callers
    pub fn is_client_visible(&self) -> bool {
        self.status_code() < 500
    }

    /// Message returned to API callers
    pub fn client_message(&self) -> String {
        match self {
            GatewayError::GatewayUnavailable { .. } => "All providers for this task are unavailable".to_string(),
            _ if self.is_client_visible() => self.to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// Type alias for Results that use the gateway error type
pub type Result<T> = std::result::Result<T, GatewayError>;
