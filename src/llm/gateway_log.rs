//! Gateway log model
//!
//! One [`GatewayLogRecord`] is written per upstream call attempt, retries
//! included. Records are never updated; dashboards read them through
//! [`crate::storage::GatewayLogStore`] queries and the aggregations below.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::GatewayError;

/// Immutable record of one upstream attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayLogRecord {
    pub request_id: Uuid,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub task_type: Option<String>,
    pub provider_id: String,
    pub model_id: String,
    pub request_payload: serde_json::Value,
    pub response_payload: serde_json::Value,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GatewayLogRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Query window, always relative to call time ("last 24h", not "today")
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub fn duration(&self) -> Duration {
        match self {
            TimeRange::LastHour => Duration::hours(1),
            TimeRange::LastDay => Duration::hours(24),
            TimeRange::LastWeek => Duration::days(7),
            TimeRange::LastMonth => Duration::days(30),
        }
    }

    /// Earliest timestamp inside the window ending at `now`
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.duration()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::LastHour => "1h",
            TimeRange::LastDay => "24h",
            TimeRange::LastWeek => "7d",
            TimeRange::LastMonth => "30d",
        }
    }
}

impl FromStr for TimeRange {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(TimeRange::LastHour),
            "24h" => Ok(TimeRange::LastDay),
            "7d" => Ok(TimeRange::LastWeek),
            "30d" => Ok(TimeRange::LastMonth),
            other => Err(GatewayError::Validation(format!(
                "invalid time range '{}', expected one of 1h, 24h, 7d, 30d",
                other
            ))),
        }
    }
}

/// Outcome filter for log listings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Success,
    Error,
}

impl FromStr for StatusFilter {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(StatusFilter::Success),
            "error" => Ok(StatusFilter::Error),
            other => Err(GatewayError::Validation(format!(
                "invalid status filter '{}', expected success or error",
                other
            ))),
        }
    }
}

/// Filters for `recent_logs`; `None` means "any"
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LogFilters {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub task_type: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<StatusFilter>,
}

impl LogFilters {
    pub fn matches(&self, record: &GatewayLogRecord) -> bool {
        fn eq(filter: &Option<String>, value: Option<&str>) -> bool {
            filter.as_deref().map_or(true, |f| value == Some(f))
        }

        eq(&self.provider_id, Some(record.provider_id.as_str()))
            && eq(&self.model_id, Some(record.model_id.as_str()))
            && eq(&self.task_type, record.task_type.as_deref())
            && eq(&self.user_id, record.user_id.as_deref())
            && match self.status {
                Some(StatusFilter::Success) => record.is_success(),
                Some(StatusFilter::Error) => !record.is_success(),
                None => true,
            }
    }
}

/// Totals over a time range
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregatedMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub total_cost_usd: f64,
}

impl AggregatedMetrics {
    pub fn from_records(records: &[GatewayLogRecord]) -> Self {
        let successful = records.iter().filter(|r| r.is_success()).count() as u64;
        Self::from_totals(
            records.len() as u64,
            successful,
            records.iter().map(|r| r.latency_ms).sum(),
            records.iter().map(|r| r.cost_usd).sum(),
        )
    }

    /// Build from raw sums, as returned by a database aggregate
    pub fn from_totals(total: u64, successful: u64, latency_sum_ms: u64, total_cost_usd: f64) -> Self {
        if total == 0 {
            return Self::default();
        }
        let successful = successful.min(total);

        Self {
            total_requests: total,
            successful_requests: successful,
            failed_requests: total - successful,
            success_rate: successful as f64 / total as f64,
            average_latency_ms: latency_sum_ms as f64 / total as f64,
            total_cost_usd,
        }
    }
}

/// Per-provider totals over a time range
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderStats {
    pub provider_id: String,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
    pub total_cost_usd: f64,
}

impl ProviderStats {
    /// Group records by provider, sorted by provider id
    pub fn from_records(records: &[GatewayLogRecord]) -> Vec<ProviderStats> {
        let mut grouped: BTreeMap<&str, (ProviderStats, u64)> = BTreeMap::new();

        for record in records {
            let (stats, latency_sum) = grouped.entry(record.provider_id.as_str()).or_insert_with(|| {
                (
                    ProviderStats {
                        provider_id: record.provider_id.clone(),
                        ..ProviderStats::default()
                    },
                    0,
                )
            });
            stats.total_requests += 1;
            if record.is_success() {
                stats.success_count += 1;
            } else {
                stats.error_count += 1;
            }
            stats.total_cost_usd += record.cost_usd;
            *latency_sum += record.latency_ms;
        }

        grouped
            .into_values()
            .map(|(mut stats, latency_sum)| {
                stats.average_latency_ms = latency_sum as f64 / stats.total_requests as f64;
                stats
            })
            .collect()
    }

    /// Build one provider's row from raw sums
    pub fn from_totals(
        provider_id: impl Into<String>,
        total: u64,
        successful: u64,
        latency_sum_ms: u64,
        total_cost_usd: f64,
    ) -> Self {
        let successful = successful.min(total);
        Self {
            provider_id: provider_id.into(),
            total_requests: total,
            success_count: successful,
            error_count: total - successful,
            average_latency_ms: if total == 0 {
                0.0
            } else {
                latency_sum_ms as f64 / total as f64
            },
            total_cost_usd,
        }
    }
}
