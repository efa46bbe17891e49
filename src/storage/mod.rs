//! Persistence for usage records and gateway logs
//!
//! Two append-only stores sit behind async traits so the router, the cost
//! accountant and the API can run against either backend:
//!
//! - [`InMemoryStore`]: `RwLock`-guarded vectors, used by tests and when no
//!   database is configured.
//! - [`SqliteStore`]: sqlx-backed SQLite tables for the server.
//!
//! Neither trait exposes update or delete operations.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::llm::cost::{CostRecord, UsageTotals};
use crate::llm::gateway_log::{AggregatedMetrics, GatewayLogRecord, LogFilters, ProviderStats, TimeRange};
use crate::Result;

#[async_trait]
pub trait CostStore: Send + Sync {
    async fn insert_cost(&self, record: &CostRecord) -> Result<()>;

    /// Totals over a user's records in a session
    async fn session_usage(&self, user_id: &str, session_id: &str) -> Result<UsageTotals>;

    /// Most recently created record of a user's session
    async fn latest_session_record(&self, user_id: &str, session_id: &str) -> Result<Option<CostRecord>>;

    /// Totals over a user's records with `start <= created_at < end`
    async fn user_usage_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageTotals>;

    /// A user's records created at or after `since`, oldest first
    async fn user_records_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<CostRecord>>;
}

#[async_trait]
pub trait GatewayLogStore: Send + Sync {
    async fn append(&self, record: &GatewayLogRecord) -> Result<()>;

    /// Matching records, newest first
    async fn recent_logs(&self, limit: usize, offset: usize, filters: &LogFilters) -> Result<Vec<GatewayLogRecord>>;

    /// Records created at or after `since`
    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<GatewayLogRecord>>;

    async fn aggregated_metrics(&self, range: TimeRange) -> Result<AggregatedMetrics> {
        self.aggregated_metrics_at(range, Utc::now()).await
    }

    async fn aggregated_metrics_at(&self, range: TimeRange, now: DateTime<Utc>) -> Result<AggregatedMetrics> {
        let records = window(self.logs_since(range.start(now)).await?, now);
        Ok(AggregatedMetrics::from_records(&records))
    }

    async fn provider_stats(&self, range: TimeRange) -> Result<Vec<ProviderStats>> {
        self.provider_stats_at(range, Utc::now()).await
    }

    async fn provider_stats_at(&self, range: TimeRange, now: DateTime<Utc>) -> Result<Vec<ProviderStats>> {
        let records = window(self.logs_since(range.start(now)).await?, now);
        Ok(ProviderStats::from_records(&records))
    }
}

fn window(mut records: Vec<GatewayLogRecord>, now: DateTime<Utc>) -> Vec<GatewayLogRecord> {
    records.retain(|r| r.created_at <= now);
    records
}

/// In-memory store for tests and database-less deployments
#[derive(Default)]
pub struct InMemoryStore {
    costs: RwLock<Vec<CostRecord>>,
    logs: RwLock<Vec<GatewayLogRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cost_record_count(&self) -> usize {
        self.costs.read().await.len()
    }

    pub async fn log_count(&self) -> usize {
        self.logs.read().await.len()
    }
}

#[async_trait]
impl CostStore for InMemoryStore {
    async fn insert_cost(&self, record: &CostRecord) -> Result<()> {
        self.costs.write().await.push(record.clone());
        Ok(())
    }

    async fn session_usage(&self, user_id: &str, session_id: &str) -> Result<UsageTotals> {
        let costs = self.costs.read().await;
        let mut totals = UsageTotals::default();
        costs
            .iter()
            .filter(|r| r.user_id == user_id && r.session_id == session_id)
            .for_each(|r| totals.add(r));
        Ok(totals)
    }

    async fn latest_session_record(&self, user_id: &str, session_id: &str) -> Result<Option<CostRecord>> {
        let costs = self.costs.read().await;
        // max_by_key keeps the last of equal keys, i.e. the latest insert
        Ok(costs
            .iter()
            .filter(|r| r.user_id == user_id && r.session_id == session_id)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn user_usage_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageTotals> {
        let costs = self.costs.read().await;
        let mut totals = UsageTotals::default();
        costs
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= start && r.created_at < end)
            .for_each(|r| totals.add(r));
        Ok(totals)
    }

    async fn user_records_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<CostRecord>> {
        let costs = self.costs.read().await;
        let mut records: Vec<_> = costs
            .iter()
            .filter(|r| r.user_id == user_id && r.created_at >= since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[async_trait]
impl GatewayLogStore for InMemoryStore {
    async fn append(&self, record: &GatewayLogRecord) -> Result<()> {
        self.logs.write().await.push(record.clone());
        Ok(())
    }

    async fn recent_logs(&self, limit: usize, offset: usize, filters: &LogFilters) -> Result<Vec<GatewayLogRecord>> {
        let logs = self.logs.read().await;
        let mut matching: Vec<_> = logs.iter().rev().filter(|r| filters.matches(r)).cloned().collect();
        // Stable sort keeps later inserts first among equal timestamps
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn logs_since(&self, since: DateTime<Utc>) -> Result<Vec<GatewayLogRecord>> {
        let logs = self.logs.read().await;
        Ok(logs.iter().filter(|r| r.created_at >= since).cloned().collect())
    }
}

/// Stores shared by the router, the accountant and the API
#[derive(Clone)]
pub struct Stores {
    pub costs: Arc<dyn CostStore>,
    pub logs: Arc<dyn GatewayLogStore>,
}

/// Open the configured backend; no URL means in-memory
pub async fn open_stores(database_url: Option<&str>) -> Result<Stores> {
    match database_url {
        Some(url) => {
            let store = Arc::new(SqliteStore::connect(url).await?);
            store.init().await?;
            info!("Using SQLite storage at {}", url);
            Ok(Stores {
                costs: store.clone(),
                logs: store,
            })
        }
        None => {
            info!("No database configured, using in-memory storage");
            let store = Arc::new(InMemoryStore::new());
            Ok(Stores {
                costs: store.clone(),
                logs: store,
            })
        }
    }
}
