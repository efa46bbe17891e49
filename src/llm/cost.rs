//! Cost Accounting and Budget Management
//!
//! This module records billable usage, aggregates it per session and per
//! calendar month, and compares the aggregates against the process-wide
//! [`Budget`] to produce warnings for the dashboards.
//!
//! ## Boundaries
//!
//! Warnings use a strict greater-than comparison: usage exactly at
//! `limit * warn_threshold` does not warn, one token above does.
//!
//! ## Idempotency
//!
//! `record_usage` has no dedup key. Callers record each billable event once.

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::storage::CostStore;
use crate::{GatewayError, Result};

/// Kind of billable operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Routing,
    AgentExecution,
    Search,
    Other,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Routing => "routing",
            OperationType::AgentExecution => "agent_execution",
            OperationType::Search => "search",
            OperationType::Other => "other",
        }
    }
}

impl FromStr for OperationType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "routing" => Ok(OperationType::Routing),
            "agent_execution" => Ok(OperationType::AgentExecution),
            "search" => Ok(OperationType::Search),
            "other" => Ok(OperationType::Other),
            other => Err(GatewayError::Validation(format!(
                "invalid operation_type '{}', expected routing, agent_execution, search or other",
                other
            ))),
        }
    }
}

/// One billable operation; never mutated once recorded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostRecord {
    pub user_id: String,
    pub session_id: String,
    pub query_id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub operation_type: OperationType,
    pub created_at: DateTime<Utc>,
}

impl CostRecord {
    /// Reject records that must never be persisted
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("user_id", &self.user_id),
            ("session_id", &self.session_id),
            ("query_id", &self.query_id),
            ("model", &self.model),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::Validation(format!("{} must not be empty", field)));
            }
        }

        for (field, value) in [
            ("prompt_tokens", self.prompt_tokens),
            ("completion_tokens", self.completion_tokens),
            ("total_tokens", self.total_tokens),
        ] {
            if value < 0 {
                return Err(GatewayError::Validation(format!(
                    "{} must be non-negative, got {}",
                    field, value
                )));
            }
        }

        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(GatewayError::Validation(format!(
                "cost_usd must be a non-negative number, got {}",
                self.cost_usd
            )));
        }

        Ok(())
    }
}

const THRESHOLD_SCALE: i128 = 1_000_000;

/// Process-wide usage ceilings, in tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Budget {
    pub query_limit: i64,
    pub session_limit: i64,
    pub user_monthly_limit: i64,
    pub warn_threshold: f64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            query_limit: 10_000,
            session_limit: 50_000,
            user_monthly_limit: 500_000,
            warn_threshold: 0.8,
        }
    }
}

impl Budget {
    pub fn validate(&self) -> Result<()> {
        if self.query_limit <= 0 || self.session_limit <= 0 || self.user_monthly_limit <= 0 {
            return Err(GatewayError::Config("budget limits must be positive".to_string()));
        }
        if !(self.warn_threshold > 0.0 && self.warn_threshold <= 1.0) {
            return Err(GatewayError::Config(format!(
                "budget warn_threshold must be in (0, 1], got {}",
                self.warn_threshold
            )));
        }
        Ok(())
    }

    /// Threshold in parts per million so boundary checks stay exact
    fn threshold_ppm(&self) -> i128 {
        (self.warn_threshold * THRESHOLD_SCALE as f64).round() as i128
    }

    fn approaching(&self, usage: i64, limit: i64) -> bool {
        usage as i128 * THRESHOLD_SCALE > limit as i128 * self.threshold_ppm()
    }

    /// Warnings for the given aggregates
    pub fn warnings(&self, session_usage: i64, user_monthly_usage: i64) -> Vec<BudgetWarning> {
        let mut warnings = Vec::new();
        if self.approaching(session_usage, self.session_limit) {
            warnings.push(BudgetWarning::SessionApproachingLimit);
        }
        if self.approaching(user_monthly_usage, self.user_monthly_limit) {
            warnings.push(BudgetWarning::UserApproachingLimit);
        }
        warnings
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWarning {
    SessionApproachingLimit,
    UserApproachingLimit,
}

/// Live usage compared against the budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetStatus {
    pub query_limit: i64,
    pub session_limit: i64,
    pub user_monthly_limit: i64,
    pub query_usage: i64,
    pub session_usage: i64,
    pub user_monthly_usage: i64,
    pub warnings: Vec<BudgetWarning>,
    pub total_cost_this_month: f64,
}

/// Sums over a set of cost records
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageTotals {
    pub total_tokens: i64,
    pub total_cost: f64,
    pub record_count: u64,
}

impl UsageTotals {
    pub fn add(&mut self, record: &CostRecord) {
        self.total_tokens += record.total_tokens;
        self.total_cost += record.cost_usd;
        self.record_count += 1;
    }
}

/// Calendar month in the server-local timezone
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CalendarMonth {
    pub year: i32,
    pub month: u32,
}

impl CalendarMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(GatewayError::Validation(format!("invalid month {}", month)));
        }
        Ok(Self { year, month })
    }

    /// Month containing `instant`, as seen on the server's wall clock
    pub fn containing(instant: DateTime<Utc>) -> Self {
        let local = instant.with_timezone(&Local);
        Self {
            year: local.year(),
            month: local.month(),
        }
    }

    pub fn current() -> Self {
        Self::containing(Utc::now())
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Half-open `[start, end)` interval covered by the month
    pub fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let next = self.next();
        Ok((local_midnight(self.year, self.month, 1)?, local_midnight(next.year, next.month, 1)?))
    }
}

impl std::fmt::Display for CalendarMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

fn local_midnight(year: i32, month: u32, day: u32) -> Result<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| GatewayError::Validation(format!("invalid date {}-{}-{}", year, month, day)))?;
    local_day_start(date)
}

fn local_day_start(date: NaiveDate) -> Result<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| GatewayError::Internal(format!("no midnight for {}", date)))?;
    // DST transitions can make local midnight ambiguous or skip it.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| GatewayError::Internal(format!("local midnight of {} does not exist", date)))
}

/// Usage of one local calendar day
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyTrend {
    pub date: NaiveDate,
    pub total_tokens: i64,
    pub total_cost: f64,
}

/// Records usage and answers budget questions
pub struct CostAccountant {
    store: Arc<dyn CostStore>,
    budget: Budget,
}

impl CostAccountant {
    pub fn new(store: Arc<dyn CostStore>, budget: Budget) -> Self {
        Self { store, budget }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Validate and persist one billable operation
    ///
    /// Nothing is written when validation fails.
    pub async fn record_usage(&self, record: CostRecord) -> Result<()> {
        record.validate()?;
        self.store.insert_cost(&record).await?;
        debug!(
            "Recorded {} tokens (${:.6}) for user {} session {} ({})",
            record.total_tokens,
            record.cost_usd,
            record.user_id,
            record.session_id,
            record.operation_type.as_str()
        );
        Ok(())
    }

    /// Tokens a user spent in a session
    ///
    /// Other users' records under the same session id are not counted.
    pub async fn session_total(&self, user_id: &str, session_id: &str) -> Result<i64> {
        Ok(self.store.session_usage(user_id, session_id).await?.total_tokens)
    }

    /// Tokens used by a user during a calendar month; zero when there is no usage
    pub async fn user_monthly_total(&self, user_id: &str, month: CalendarMonth) -> Result<i64> {
        let (start, end) = month.bounds()?;
        Ok(self.store.user_usage_between(user_id, start, end).await?.total_tokens)
    }

    /// Dollars spent by a user during a calendar month
    pub async fn monthly_total_cost(&self, user_id: &str, month: CalendarMonth) -> Result<f64> {
        let (start, end) = month.bounds()?;
        Ok(self.store.user_usage_between(user_id, start, end).await?.total_cost)
    }

    /// Compare live aggregates against the budget
    ///
    /// `query_usage` is the token count of the session's most recent record.
    pub async fn check_budget(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<BudgetStatus> {
        let (session_usage, query_usage) = match session_id {
            Some(session_id) => {
                let totals = self.store.session_usage(user_id, session_id).await?;
                let latest = self.store.latest_session_record(user_id, session_id).await?;
                (totals.total_tokens, latest.map(|r| r.total_tokens).unwrap_or(0))
            }
            None => (0, 0),
        };

        let (start, end) = CalendarMonth::containing(now).bounds()?;
        let monthly = self.store.user_usage_between(user_id, start, end).await?;

        let warnings = self.budget.warnings(session_usage, monthly.total_tokens);
        if !warnings.is_empty() {
            info!("Budget warnings for user {}: {:?}", user_id, warnings);
        }

        Ok(BudgetStatus {
            query_limit: self.budget.query_limit,
            session_limit: self.budget.session_limit,
            user_monthly_limit: self.budget.user_monthly_limit,
            query_usage,
            session_usage,
            user_monthly_usage: monthly.total_tokens,
            warnings,
            total_cost_this_month: monthly.total_cost,
        })
    }

    /// Per-day usage for the last `days` local days, oldest first
    ///
    /// Days without usage are omitted.
    pub async fn daily_trends(&self, user_id: &str, days: u32, now: DateTime<Utc>) -> Result<Vec<DailyTrend>> {
        if days == 0 {
            return Err(GatewayError::Validation("days must be at least 1".to_string()));
        }

        let today = now.with_timezone(&Local).date_naive();
        let first_day = today - chrono::Duration::days(days as i64 - 1);
        let since = local_day_start(first_day)?;

        let records = self.store.user_records_since(user_id, since).await?;

        let mut by_day: BTreeMap<NaiveDate, UsageTotals> = BTreeMap::new();
        for record in records.iter().filter(|r| r.created_at <= now) {
            let day = record.created_at.with_timezone(&Local).date_naive();
            by_day.entry(day).or_default().add(record);
        }

        Ok(by_day
            .into_iter()
            .map(|(date, totals)| DailyTrend {
                date,
                total_tokens: totals.total_tokens,
                total_cost: totals.total_cost,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    pub(crate) fn record(user: &str, session: &str, tokens: i64, created_at: DateTime<Utc>) -> CostRecord {
        CostRecord {
            user_id: user.to_string(),
            session_id: session.to_string(),
            query_id: uuid::Uuid::new_v4().to_string(),
            model: "deepseek-chat".to_string(),
            prompt_tokens: tokens / 2,
            completion_tokens: tokens - tokens / 2,
            total_tokens: tokens,
            cost_usd: tokens as f64 * 0.000001,
            operation_type: OperationType::Routing,
            created_at,
        }
    }

    fn accountant(budget: Budget) -> (CostAccountant, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (CostAccountant::new(store.clone(), budget), store)
    }

    #[test]
    fn test_operation_type_parse() {
        assert_eq!("agent_execution".parse::<OperationType>().unwrap(), OperationType::AgentExecution);
        assert!(matches!("billing".parse::<OperationType>(), Err(GatewayError::Validation(_))));
        assert!("Routing".parse::<OperationType>().is_err());
    }

    #[test]
    fn test_budget_example_boundary() {
        let budget = Budget {
            session_limit: 100,
            warn_threshold: 0.8,
            ..Budget::default()
        };
        assert_eq!(budget.warnings(81, 0), vec![BudgetWarning::SessionApproachingLimit]);
        assert!(budget.warnings(80, 0).is_empty());
    }

    #[test]
    fn test_budget_boundary_exact_for_inexact_thresholds() {
        // 100 * 0.29 and 100 * 0.57 are not exact in f64
        for (threshold, at) in [(0.29, 29), (0.57, 57), (0.7, 70)] {
            let budget = Budget {
                session_limit: 100,
                user_monthly_limit: 100,
                warn_threshold: threshold,
                ..Budget::default()
            };
            assert!(budget.warnings(at, at).is_empty(), "threshold {}", threshold);
            assert_eq!(budget.warnings(at + 1, 0), vec![BudgetWarning::SessionApproachingLimit]);
        }
    }

    #[test]
    fn test_budget_boundary_is_strict() {
        let budget = Budget::default();
        // 50_000 * 0.8 and 500_000 * 0.8
        assert!(budget.warnings(40_000, 400_000).is_empty());
        assert_eq!(
            budget.warnings(40_001, 400_001),
            vec![
                BudgetWarning::SessionApproachingLimit,
                BudgetWarning::UserApproachingLimit
            ]
        );
        assert_eq!(budget.warnings(0, 400_001), vec![BudgetWarning::UserApproachingLimit]);
    }

    #[test]
    fn test_budget_validation() {
        assert_ok!(Budget::default().validate());
        let bad_threshold = Budget {
            warn_threshold: 1.5,
            ..Budget::default()
        };
        assert_err!(bad_threshold.validate());
        let bad_limit = Budget {
            session_limit: 0,
            ..Budget::default()
        };
        assert_err!(bad_limit.validate());
    }

    #[test]
    fn test_warning_serialization() {
        let json = serde_json::to_value(vec![
            BudgetWarning::SessionApproachingLimit,
            BudgetWarning::UserApproachingLimit,
        ])
        .unwrap();
        assert_eq!(json, serde_json::json!(["session_approaching_limit", "user_approaching_limit"]));
    }

    #[test]
    fn test_calendar_month_bounds() {
        let month = CalendarMonth::new(2024, 12).unwrap();
        assert_eq!(month.next(), CalendarMonth::new(2025, 1).unwrap());
        let (start, end) = month.bounds().unwrap();
        assert!(start < end);
        assert_eq!(CalendarMonth::containing(start), month);
        assert_eq!(CalendarMonth::containing(end), month.next());
        assert_eq!(CalendarMonth::containing(end - Duration::seconds(1)), month);
        assert_eq!(month.to_string(), "2024-12");
        assert!(CalendarMonth::new(2024, 13).is_err());
    }

    #[tokio::test]
    async fn test_negative_tokens_rejected_and_not_persisted() {
        let (accountant, store) = accountant(Budget::default());
        let now = Utc::now();

        for field in 0..3 {
            let mut bad = record("user-1", "session-1", 100, now);
            match field {
                0 => bad.prompt_tokens = -1,
                1 => bad.completion_tokens = -5,
                _ => bad.total_tokens = -100,
            }
            let result = accountant.record_usage(bad).await;
            assert!(matches!(result, Err(GatewayError::Validation(_))));
        }

        assert_eq!(store.cost_record_count().await, 0);
        assert_eq!(accountant.session_total("user-1", "session-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cost_and_ids_rejected() {
        let (accountant, store) = accountant(Budget::default());
        let now = Utc::now();

        let mut negative_cost = record("user-1", "session-1", 10, now);
        negative_cost.cost_usd = -0.5;
        assert_err!(accountant.record_usage(negative_cost).await);

        let mut nan_cost = record("user-1", "session-1", 10, now);
        nan_cost.cost_usd = f64::NAN;
        assert_err!(accountant.record_usage(nan_cost).await);

        let mut no_session = record("user-1", "", 10, now);
        no_session.session_id = "  ".to_string();
        assert_err!(accountant.record_usage(no_session).await);

        assert_eq!(store.cost_record_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_total() {
        let (accountant, _) = accountant(Budget::default());
        let now = Utc::now();

        accountant.record_usage(record("user-1", "session-1", 100, now)).await.unwrap();
        accountant.record_usage(record("user-1", "session-1", 250, now)).await.unwrap();
        accountant.record_usage(record("user-1", "session-2", 999, now)).await.unwrap();

        assert_eq!(accountant.session_total("user-1", "session-1").await.unwrap(), 350);
        assert_eq!(accountant.session_total("user-1", "session-3").await.unwrap(), 0);
        assert_eq!(accountant.session_total("user-2", "session-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_user_monthly_total_zero_without_records() {
        let (accountant, _) = accountant(Budget::default());
        let month = CalendarMonth::current();
        assert_eq!(accountant.user_monthly_total("nobody", month).await.unwrap(), 0);
        assert_eq!(accountant.monthly_total_cost("nobody", month).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_user_monthly_total_respects_month_bounds() {
        let (accountant, _) = accountant(Budget::default());
        let month = CalendarMonth::current();
        let (start, _) = month.bounds().unwrap();

        accountant.record_usage(record("user-1", "s1", 100, start)).await.unwrap();
        accountant
            .record_usage(record("user-1", "s1", 1000, start - Duration::seconds(1)))
            .await
            .unwrap();
        accountant.record_usage(record("user-2", "s2", 7, start)).await.unwrap();

        assert_eq!(accountant.user_monthly_total("user-1", month).await.unwrap(), 100);

        let previous = CalendarMonth::containing(start - Duration::seconds(1));
        assert_eq!(accountant.user_monthly_total("user-1", previous).await.unwrap(), 1000);

        let cost = accountant.monthly_total_cost("user-1", month).await.unwrap();
        assert!((cost - 0.0001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_check_budget() {
        let budget = Budget {
            query_limit: 50,
            session_limit: 100,
            user_monthly_limit: 1000,
            warn_threshold: 0.8,
        };
        let (accountant, _) = accountant(budget);
        let now = Utc::now();

        accountant.record_usage(record("user-1", "session-1", 60, now)).await.unwrap();
        accountant.record_usage(record("user-1", "session-1", 21, now)).await.unwrap();

        let status = accountant.check_budget("user-1", Some("session-1"), now).await.unwrap();
        assert_eq!(status.session_usage, 81);
        assert_eq!(status.user_monthly_usage, 81);
        assert_eq!(status.query_usage, 21);
        assert_eq!(status.query_limit, 50);
        assert_eq!(status.warnings, vec![BudgetWarning::SessionApproachingLimit]);
        assert!(status.total_cost_this_month > 0.0);

        let without_session = accountant.check_budget("user-1", None, now).await.unwrap();
        assert_eq!(without_session.session_usage, 0);
        assert_eq!(without_session.query_usage, 0);
        assert!(without_session.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_check_budget_ignores_other_users_in_same_session() {
        let budget = Budget {
            session_limit: 100,
            ..Budget::default()
        };
        let (accountant, _) = accountant(budget);
        let now = Utc::now();

        accountant.record_usage(record("user-1", "shared", 90, now)).await.unwrap();
        accountant.record_usage(record("user-2", "shared", 5, now)).await.unwrap();

        let other = accountant.check_budget("user-2", Some("shared"), now).await.unwrap();
        assert_eq!(other.session_usage, 5);
        assert_eq!(other.query_usage, 5);
        assert!(other.warnings.is_empty());

        let owner = accountant.check_budget("user-1", Some("shared"), now).await.unwrap();
        assert_eq!(owner.session_usage, 90);
        assert_eq!(owner.warnings, vec![BudgetWarning::SessionApproachingLimit]);
    }

    #[tokio::test]
    async fn test_daily_trends() {
        let (accountant, _) = accountant(Budget::default());
        let now = Utc::now();

        accountant.record_usage(record("user-1", "s", 10, now)).await.unwrap();
        accountant.record_usage(record("user-1", "s", 5, now)).await.unwrap();
        accountant
            .record_usage(record("user-1", "s", 40, now - Duration::days(2)))
            .await
            .unwrap();
        accountant
            .record_usage(record("user-1", "s", 1000, now - Duration::days(40)))
            .await
            .unwrap();

        let trends = accountant.daily_trends("user-1", 30, now).await.unwrap();
        assert_eq!(trends.len(), 2);
        assert!(trends[0].date < trends[1].date);
        assert_eq!(trends[0].total_tokens, 40);
        assert_eq!(trends[1].total_tokens, 15);

        let today_only = accountant.daily_trends("user-1", 1, now).await.unwrap();
        assert_eq!(today_only.len(), 1);
        assert_eq!(today_only[0].total_tokens, 15);

        assert_err!(accountant.daily_trends("user-1", 0, now).await);
    }
}
