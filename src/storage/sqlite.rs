//! SQLite backend
//!
//! Timestamps are stored as INTEGER milliseconds since the epoch so range
//! predicates compare numerically. Payloads are stored as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use super::{CostStore, GatewayLogStore};
use crate::llm::cost::{CostRecord, OperationType, UsageTotals};
use crate::llm::gateway_log::{AggregatedMetrics, GatewayLogRecord, LogFilters, ProviderStats, StatusFilter, TimeRange};
use crate::{GatewayError, Result};

const COST_COLUMNS: &str = "user_id, session_id, query_id, model, prompt_tokens, completion_tokens, \
     total_tokens, cost_usd, operation_type, created_at";

const LOG_COLUMNS: &str = "request_id, user_id, session_id, task_type, provider_id, model_id, \
     request_payload, response_payload, latency_ms, cost_usd, status_code, error_message, created_at";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to `url`, creating the database file when missing
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Each connection to :memory: is its own database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes
    pub async fn init(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS cost_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                query_id TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                operation_type TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_cost_session ON cost_records(user_id, session_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_cost_user ON cost_records(user_id, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS gateway_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                user_id TEXT,
                session_id TEXT,
                task_type TEXT,
                provider_id TEXT NOT NULL,
                model_id TEXT NOT NULL,
                request_payload TEXT NOT NULL,
                response_payload TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                cost_usd REAL NOT NULL,
                status_code INTEGER NOT NULL,
                error_message TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_logs_created ON gateway_logs(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_logs_provider ON gateway_logs(provider_id, created_at)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }

    async fn totals(&self, sql: &str, binds: &[&str], range: Option<(i64, i64)>) -> Result<UsageTotals> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        if let Some((start, end)) = range {
            query = query.bind(start).bind(end);
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(UsageTotals {
            total_tokens: row.try_get("total_tokens")?,
            total_cost: row.try_get("total_cost")?,
            record_count: row.try_get::<i64, _>("record_count")?.max(0) as u64,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| GatewayError::Storage(format!("invalid timestamp {}", ms)))
}

fn cost_from_row(row: &SqliteRow) -> Result<CostRecord> {
    let operation_type: String = row.try_get("operation_type")?;
    Ok(CostRecord {
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        query_id: row.try_get("query_id")?,
        model: row.try_get("model")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        cost_usd: row.try_get("cost_usd")?,
        operation_type: OperationType::from_str(&operation_type)
            .map_err(|e| GatewayError::Storage(e.to_string()))?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<GatewayLogRecord> {
    let request_id: String = row.try_get("request_id")?;
    let request_payload: String = row.try_get("request_payload")?;
    let response_payload: String = row.try_get("response_payload")?;
    let status_code: i64 = row.try_get("status_code")?;
    let latency_ms: i64 = row.try_get("latency_ms")?;

    Ok(GatewayLogRecord {
        request_id: Uuid::parse_str(&request_id).map_err(|e| GatewayError::Storage(e.to_string()))?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        task_type: row.try_get("task_type")?,
        provider_id: row.try_get("provider_id")?,
        model_id: row.try_get("model_id")?,
        request_payload: serde_json::from_str(&request_payload)?,
        response_payload: serde_json::from_str(&response_payload)?,
        latency_ms: latency_ms.max(0) as u64,
        cost_usd: row.try_get("cost_usd")?,
        status_code: u16::try_from(status_code)
            .map_err(|_| GatewayError::Storage(format!("invalid status code {}", status_code)))?,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

// Sums over gateway_logs; callers bind the window start and end as ?1 and ?2
const LOG_AGGREGATES: &str = "COUNT(*) AS total_requests, \
     CAST(COALESCE(SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END), 0) AS INTEGER) AS successful, \
     CAST(COALESCE(SUM(latency_ms), 0) AS INTEGER) AS latency_sum, \
     CAST(COALESCE(SUM(cost_usd), 0) AS REAL) AS total_cost";

fn non_negative(row: &SqliteRow, column: &str) -> Result<u64> {
    Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
}

const TOTALS_SELECT: &str = "SELECT CAST(COALESCE(SUM(total_tokens), 0) AS INTEGER) AS total_tokens, \
     CAST(COALESCE(SUM(cost_usd), 0) AS REAL) AS total_cost, \
     COUNT(*) AS record_count FROM cost_records";

#[async_trait]
impl CostStore for SqliteStore {
    async fn insert_cost(&self, record: &CostRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO cost_records ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COST_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&record.user_id)
            .bind(&record.session_id)
            .bind(&record.query_id)
            .bind(&record.model)
            .bind(record.prompt_tokens)
            .bind(record.completion_tokens)
            .bind(record.total_tokens)
            .bind(record.cost_usd)
            .bind(record.operation_type.as_str())
            .bind(to_millis(record.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn session_usage(&self, user_id: &str, session_id: &str) -> Result<UsageTotals> {
        let sql = format!("{} WHERE user_id = ? AND session_id = ?", TOTALS_SELECT);
        self.totals(&sql, &[user_id, session_id], None).await
    }

    async fn latest_session_record(&self, user_id: &str, session_id: &str) -> Result<Option<CostRecord>> {
        let sql = format!(
            "SELECT {} FROM cost_records WHERE user_id = ? AND session_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            COST_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cost_from_row).transpose()
    }

    async fn user_usage_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageTotals> {
        let sql = format!(
            "{} WHERE user_id = ? AND created_at >= ? AND created_at < ?",
            TOTALS_SELECT
        );
        self.totals(&sql, &[user_id], Some((to_millis(start), to_millis(end))))
            .await
    }

    async fn user_records_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<CostRecord>> {
        let sql = format!(
            "SELECT {} FROM cost_records WHERE user_id = ? AND created_at >= ? ORDER BY created_at, id",
            COST_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(to_millis(since))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(cost_from_row).collect()
    }
}

#[async_trait]
impl GatewayLogStore for SqliteStore {
    async fn append(&self, record: &GatewayLogRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO gateway_logs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LOG_COLUMNS
        );
        sqlx::query(&sql)
            .bind(record.request_id.to_string())
            .bind(&record.user_id)
            .bind(&record.session_id)
            .bind(&record.task_type)
            .bind(&record.provider_id)
            .bind(&record.model_id)
            .bind(serde_json::to_string(&record.request_payload)?)
            .bind(serde_json::to_string(&record.response_payload)?)
            .bind(record.latency_ms as i64)
            .bind(record.cost_usd)
            .bind(record.status_code as i64)
            .bind(&record.error_message)
            .bind(to_millis(record.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_logs(&self, limit: usize, offset: usize, filters: &LogFilters) -> Result<Vec<GatewayLogRecord>> {
        let status = filters.status.map(|s| match s {
            StatusFilter::Success => "success",
            StatusFilter::Error => "error",
        });

        let sql = format!(
            r#"
            SELECT {} FROM gateway_logs
            WHERE (?1 IS NULL OR provider_id = ?1)
              AND (?2 IS NULL OR model_id = ?2)
              AND (?3 IS NULL OR task_type = ?3)
              AND (?4 IS NULL OR user_id = ?4)
              AND (?5 IS NULL
                   OR (?5 = 'success' AND status_code BETWEEN 200 AND 299)
                   OR (?5 = 'error' AND (status_code < 200 OR status_code > 299)))
            ORDER BY created_at DESC, id DESC
            LIMIT ?6 OFFSET ?7
            "#,
            LOG_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(filters.provider_id.as_deref())
            .bind(filters.model_id.as_deref())
            .bind(filters.task_type.as_deref())
            .bind(filters.user_id.as_deref())
            .bind(status)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn aggregated_metrics_at(&self, range: TimeRange, now: DateTime<Utc>) -> Result<AggregatedMetrics> {
        let sql = format!(
            "SELECT {} FROM gateway_logs WHERE created_at >= ?1 AND created_at <= ?2",
            LOG_AGGREGATES
        );
        let row = sqlx::query(&sql)
            .bind(to_millis(range.start(now)))
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await?;

        Ok(AggregatedMetrics::from_totals(
            non_negative(&row, "total_requests")?,
            non_negative(&row, "successful")?,
            non_negative(&row, "latency_sum")?,
            row.try_get("total_cost")?,
        ))
    }

    async fn provider_stats_at(&self, range: TimeRange, now: DateTime<Utc>) -> Result<Vec<ProviderStats>> {
        let sql = format!(
            "SELECT provider_id, {} FROM gateway_logs \
             WHERE created_at >= ?1 AND created_at <= ?2 \
             GROUP BY provider_id ORDER BY provider_id",
            LOG_AGGREGATES
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(range.start(now)))
            .bind(to_millis(now))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ProviderStats> {
                Ok(ProviderStats::from_totals(
                    row.try_get::<String, _>("provider_id")?,
                    non_negative(row, "total_requests")?,
                    non_negative(row, "successful")?,
                    non_negative(row, "latency_sum")?,
                    row.try_get("total_cost")?,
                ))
            })
            .collect()
    }

    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<GatewayLogRecord>> {
        let sql = format!(
            "SELECT {} FROM gateway_logs WHERE created_at >= ? ORDER BY created_at, id",
            LOG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(since))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(log_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::cost::tests::record as cost_record;
    use crate::llm::gateway_log::tests::record as log_record;
    use crate::storage::InMemoryStore;
    use chrono::Duration;

    async fn store() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:").await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_cost_totals() {
        let store = store().await;
        let now = Utc::now();
        store.insert_cost(&cost_record("u1", "s1", 100, now)).await.unwrap();
        store.insert_cost(&cost_record("u1", "s1", 50, now)).await.unwrap();
        store.insert_cost(&cost_record("u2", "s2", 7, now)).await.unwrap();
        store.insert_cost(&cost_record("u2", "s1", 1000, now)).await.unwrap();

        let session = store.session_usage("u1", "s1").await.unwrap();
        assert_eq!(session.total_tokens, 150);
        assert_eq!(session.record_count, 2);

        let empty = store.session_usage("u1", "none").await.unwrap();
        assert_eq!(empty.total_tokens, 0);
        assert_eq!(empty.total_cost, 0.0);
        assert_eq!(empty.record_count, 0);

        let window = store
            .user_usage_between("u1", now - Duration::seconds(1), now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(window.total_tokens, 150);

        let excluded_end = store
            .user_usage_between("u1", now - Duration::seconds(1), now)
            .await
            .unwrap();
        assert_eq!(excluded_end.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_cost_record_roundtrips_through_rows() {
        let store = store().await;
        let now = Utc::now();
        let original = cost_record("u1", "s1", 42, now);
        store.insert_cost(&original).await.unwrap();

        let latest = store.latest_session_record("u1", "s1").await.unwrap().unwrap();
        assert_eq!(latest.total_tokens, 42);
        assert_eq!(latest.operation_type, OperationType::Routing);
        assert_eq!(latest.created_at.timestamp_millis(), now.timestamp_millis());

        let since = store.user_records_since("u1", now - Duration::days(1)).await.unwrap();
        assert_eq!(since.len(), 1);
    }

    #[tokio::test]
    async fn test_log_queries() {
        let store = store().await;
        let now = Utc::now();
        store.append(&log_record("openai", 200, 100, now - Duration::minutes(2))).await.unwrap();
        store.append(&log_record("deepseek", 503, 300, now - Duration::minutes(1))).await.unwrap();
        store.append(&log_record("openai", 200, 200, now - Duration::days(2))).await.unwrap();

        let all = store.recent_logs(10, 0, &LogFilters::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].provider_id, "deepseek");
        assert_eq!(all[0].error_message.as_deref(), Some("failed"));

        let errors = store
            .recent_logs(
                10,
                0,
                &LogFilters {
                    status: Some(StatusFilter::Error),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].status_code, 503);

        let paged = store.recent_logs(1, 1, &LogFilters::default()).await.unwrap();
        assert_eq!(paged[0].latency_ms, 100);

        let metrics = store.aggregated_metrics_at(TimeRange::LastDay, now).await.unwrap();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.average_latency_ms, 200.0);
    }

    #[tokio::test]
    async fn test_aggregates_match_in_memory_store() {
        let store = store().await;
        let memory = InMemoryStore::new();
        let now = Utc::now();
        let records = [
            log_record("openai", 200, 120, now - Duration::minutes(10)),
            log_record("openai", 429, 40, now - Duration::minutes(9)),
            log_record("deepseek", 200, 300, now - Duration::minutes(8)),
            log_record("deepseek", 500, 10, now - Duration::hours(3)),
            log_record("deepseek", 200, 90, now - Duration::days(10)),
            log_record("openai", 200, 70, now + Duration::minutes(1)),
        ];
        for record in &records {
            store.append(record).await.unwrap();
            memory.append(record).await.unwrap();
        }

        for range in [TimeRange::LastHour, TimeRange::LastDay, TimeRange::LastMonth] {
            let sql = store.aggregated_metrics_at(range, now).await.unwrap();
            let expected = memory.aggregated_metrics_at(range, now).await.unwrap();
            assert_eq!(sql.total_requests, expected.total_requests);
            assert_eq!(sql.successful_requests, expected.successful_requests);
            assert_eq!(sql.average_latency_ms, expected.average_latency_ms);
            assert!((sql.total_cost_usd - expected.total_cost_usd).abs() < 1e-9);

            let sql_stats = store.provider_stats_at(range, now).await.unwrap();
            let expected_stats = memory.provider_stats_at(range, now).await.unwrap();
            assert_eq!(sql_stats.len(), expected_stats.len());
            for (a, b) in sql_stats.iter().zip(&expected_stats) {
                assert_eq!(a.provider_id, b.provider_id);
                assert_eq!(a.total_requests, b.total_requests);
                assert_eq!(a.error_count, b.error_count);
                assert_eq!(a.average_latency_ms, b.average_latency_ms);
            }
        }

        let day = store.provider_stats_at(TimeRange::LastDay, now).await.unwrap();
        assert_eq!(day[0].provider_id, "deepseek");
        assert_eq!(day[0].total_requests, 2);
        assert_eq!(day[0].error_count, 1);
        assert_eq!(day[1].total_requests, 2);

        let empty = store
            .aggregated_metrics_at(TimeRange::LastHour, now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(empty, AggregatedMetrics::default());
    }
}
