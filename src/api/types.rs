// Gateway API types
// Request/response bodies of the dashboard endpoints and the shared error envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::llm::cost::{Budget, DailyTrend};
use crate::llm::gateway_log::{AggregatedMetrics, GatewayLogRecord, ProviderStats};
use crate::llm::health::ProviderHealthView;
use crate::llm::registry::ProviderConfig;
use crate::llm::routing::{RetryPolicy, RoutingRule};
use crate::llm::ChatMessage;
use crate::GatewayError;

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,

    #[serde(rename = "type")]
    pub error_type: String,

    /// HTTP status code
    pub code: u16,
}

pub fn create_error_response(message: impl Into<String>, error_type: &str, code: u16) -> ErrorResponse {
    ErrorResponse {
        error: ErrorDetail {
            message: message.into(),
            error_type: error_type.to_string(),
            code,
        },
    }
}

impl From<GatewayError> for ErrorResponse {
    fn from(err: GatewayError) -> Self {
        if !err.is_client_visible() {
            // Details stay in the server log
            error!("Request failed: {}", err);
        }
        create_error_response(err.client_message(), err.error_type(), err.status_code())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetQuery {
    pub session_id: Option<String>,
}

/// Body of `POST /cost/track`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackCostRequest {
    pub user_id: String,
    pub session_id: String,
    pub query_id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub operation_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackCostResponse {
    pub success: bool,
    pub session_total_tokens: i64,
    pub user_monthly_total_tokens: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrendsQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendsResponse {
    pub trends: Vec<DailyTrend>,
    pub count: usize,
}

/// Body of `POST /gateway/route`; the caller comes from the auth context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(default)]
    pub task_type: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<GatewayLogRecord>,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RangeQuery {
    pub range: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub range: String,
    #[serde(flatten)]
    pub metrics: AggregatedMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatsResponse {
    pub range: String,
    pub providers: Vec<ProviderStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealthResponse {
    pub providers: Vec<ProviderHealthView>,
}

/// Static tables as served to the dashboards; API key variables are omitted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigResponse {
    pub rules: Vec<RoutingRule>,
    pub providers: Vec<ProviderConfig>,
    pub retry: RetryPolicy,
    pub budget: Budget,
}
