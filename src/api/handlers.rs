// Gateway API handlers
// Cost/budget endpoints used by the dashboards, plus gateway routing, logs and metrics

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::auth::{AuthConfig, AuthContext};
use super::types::{
    create_error_response, BudgetQuery, ErrorResponse, GatewayConfigResponse, LogsQuery, LogsResponse,
    MetricsResponse, ProviderHealthResponse, ProviderStatsResponse, RangeQuery, RouteRequest,
    TrackCostRequest, TrackCostResponse, TrendsQuery, TrendsResponse,
};
use crate::llm::cost::{BudgetStatus, CalendarMonth, CostAccountant, CostRecord, OperationType};
use crate::llm::gateway_log::{LogFilters, StatusFilter, TimeRange};
use crate::llm::router::LLMRouter;
use crate::llm::{LLMRequest, LLMResponse};
use crate::storage::GatewayLogStore;
use crate::GatewayError;

pub const DEFAULT_TREND_DAYS: u32 = 30;
pub const MAX_TREND_DAYS: u32 = 365;
pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const MAX_LOG_LIMIT: usize = 500;

/// Shared application state
#[derive(Clone)]
pub struct GatewayApiState {
    pub router: Arc<LLMRouter>,
    pub accountant: Arc<CostAccountant>,
    pub logs: Arc<dyn GatewayLogStore>,
    pub auth: Arc<AuthConfig>,
}

type ApiResult<T> = Result<Json<T>, ErrorResponse>;

fn bad_request(message: impl Into<String>) -> ErrorResponse {
    ErrorResponse::from(GatewayError::Validation(message.into()))
}

fn parse_range(range: Option<&str>) -> Result<TimeRange, ErrorResponse> {
    match range {
        Some(value) => TimeRange::from_str(value).map_err(ErrorResponse::from),
        None => Ok(TimeRange::default()),
    }
}

/// Health check endpoint - GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "eleven-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// GET /cost/budget?session_id=
pub async fn get_budget(
    State(state): State<GatewayApiState>,
    auth: AuthContext,
    query: Result<Query<BudgetQuery>, QueryRejection>,
) -> ApiResult<BudgetStatus> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let session_id = query.session_id.as_deref().filter(|s| !s.trim().is_empty());

    let status = state
        .accountant
        .check_budget(auth.user_id(), session_id, Utc::now())
        .await?;
    Ok(Json(status))
}

/// POST /cost/track
///
/// Checked in order: identity (401), body shape (400), ownership (403),
/// record validity (400).
pub async fn track_cost(
    State(state): State<GatewayApiState>,
    auth: AuthContext,
    payload: Result<Json<TrackCostRequest>, JsonRejection>,
) -> ApiResult<TrackCostResponse> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    let operation_type = OperationType::from_str(&request.operation_type)?;

    if request.user_id != auth.user_id() {
        warn!(
            "Caller {} attempted to record usage for user {}",
            auth.user_id(),
            request.user_id
        );
        return Err(GatewayError::Forbidden("user_id does not match the authenticated caller".to_string()).into());
    }

    let now = Utc::now();
    let record = CostRecord {
        user_id: request.user_id,
        session_id: request.session_id,
        query_id: request.query_id,
        model: request.model,
        prompt_tokens: request.prompt_tokens,
        completion_tokens: request.completion_tokens,
        total_tokens: request.total_tokens,
        cost_usd: request.cost_usd,
        operation_type,
        created_at: now,
    };
    let session_id = record.session_id.clone();

    state.accountant.record_usage(record).await?;

    let session_total_tokens = state.accountant.session_total(auth.user_id(), &session_id).await?;
    let user_monthly_total_tokens = state
        .accountant
        .user_monthly_total(auth.user_id(), CalendarMonth::containing(now))
        .await?;

    Ok(Json(TrackCostResponse {
        success: true,
        session_total_tokens,
        user_monthly_total_tokens,
    }))
}

/// GET /cost/trends?days=N
pub async fn cost_trends(
    State(state): State<GatewayApiState>,
    auth: AuthContext,
    query: Result<Query<TrendsQuery>, QueryRejection>,
) -> ApiResult<TrendsResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let days = query.days.unwrap_or(DEFAULT_TREND_DAYS);
    if !(1..=MAX_TREND_DAYS).contains(&days) {
        return Err(bad_request(format!("days must be between 1 and {}", MAX_TREND_DAYS)));
    }

    let trends = state.accountant.daily_trends(auth.user_id(), days, Utc::now()).await?;
    Ok(Json(TrendsResponse {
        count: trends.len(),
        trends,
    }))
}

/// POST /gateway/route
pub async fn route_request(
    State(state): State<GatewayApiState>,
    auth: AuthContext,
    payload: Result<Json<RouteRequest>, JsonRejection>,
) -> ApiResult<LLMResponse> {
    let Json(body) = payload.map_err(|e| bad_request(e.body_text()))?;
    if body.messages.is_empty() {
        return Err(bad_request("messages must not be empty"));
    }

    let mut request = LLMRequest::new(body.task_type, body.messages)
        .with_caller(auth.user_id(), body.session_id.filter(|s| !s.trim().is_empty()));
    request.temperature = body.temperature;
    request.max_tokens = body.max_tokens;

    info!(
        "Route request {} from {} (task type {:?})",
        request.id,
        auth.user_id(),
        request.task_type
    );

    let response = state.router.route(&request).await?;
    Ok(Json(response))
}

/// GET /gateway/logs
///
/// Callers only see their own records.
pub async fn list_logs(
    State(state): State<GatewayApiState>,
    auth: AuthContext,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<LogsResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;

    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    if limit == 0 || limit > MAX_LOG_LIMIT {
        return Err(bad_request(format!("limit must be between 1 and {}", MAX_LOG_LIMIT)));
    }
    let offset = query.offset.unwrap_or(0);

    let status = query
        .status
        .as_deref()
        .map(StatusFilter::from_str)
        .transpose()?;

    let filters = LogFilters {
        provider_id: query.provider,
        model_id: query.model,
        task_type: query.task_type,
        user_id: Some(auth.user_id().to_string()),
        status,
    };
    debug!("Listing gateway logs with {:?}", filters);

    let logs = state.logs.recent_logs(limit, offset, &filters).await?;
    Ok(Json(LogsResponse {
        count: logs.len(),
        logs,
        limit,
        offset,
    }))
}

/// GET /gateway/metrics?range=
pub async fn gateway_metrics(
    State(state): State<GatewayApiState>,
    _auth: AuthContext,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<MetricsResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let range = parse_range(query.range.as_deref())?;

    let metrics = state.logs.aggregated_metrics(range).await?;
    Ok(Json(MetricsResponse {
        range: range.as_str().to_string(),
        metrics,
    }))
}

/// GET /gateway/providers?range=
pub async fn provider_stats(
    State(state): State<GatewayApiState>,
    _auth: AuthContext,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<ProviderStatsResponse> {
    let Query(query) = query.map_err(|e| bad_request(e.body_text()))?;
    let range = parse_range(query.range.as_deref())?;

    let providers = state.logs.provider_stats(range).await?;
    Ok(Json(ProviderStatsResponse {
        range: range.as_str().to_string(),
        providers,
    }))
}

/// GET /gateway/providers/health
pub async fn provider_health(State(state): State<GatewayApiState>, _auth: AuthContext) -> Json<ProviderHealthResponse> {
    Json(ProviderHealthResponse {
        providers: state.router.health().snapshot(),
    })
}

/// GET /gateway/config
pub async fn gateway_config(State(state): State<GatewayApiState>, _auth: AuthContext) -> Json<GatewayConfigResponse> {
    Json(GatewayConfigResponse {
        rules: state.router.table().rules().cloned().collect(),
        providers: state.router.registry().providers().cloned().collect(),
        retry: state.router.policy().clone(),
        budget: state.accountant.budget().clone(),
    })
}

/// Fallback for unknown routes
pub async fn not_found() -> ErrorResponse {
    create_error_response("The requested endpoint does not exist", "not_found_error", 404)
}
