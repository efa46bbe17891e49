// End-to-end routing and accounting flow over the built-in configuration

use async_trait::async_trait;
use chrono::Utc;
use eleven_gateway::llm::providers::LLMProviderClient;
use eleven_gateway::llm::{ChatMessage, LLMResult, ProviderCompletion};
use eleven_gateway::storage::CostStore;
use eleven_gateway::{
    BudgetWarning, CostAccountant, GatewayConfig, GatewayError, GatewayLogStore, InMemoryStore, LLMError,
    LLMRequest, LLMRouter, LogFilters, SqliteStore, TaskType, TimeRange,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct ScriptedClient {
    id: &'static str,
    healthy: bool,
    calls: AtomicU32,
}

impl ScriptedClient {
    fn new(id: &'static str, healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            healthy,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl LLMProviderClient for ScriptedClient {
    async fn chat_completion(&self, model: &str, _request: &LLMRequest) -> LLMResult<ProviderCompletion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.healthy {
            return Err(LLMError::RateLimitExceeded(self.id.to_string()));
        }
        Ok(ProviderCompletion {
            id: format!("{}-1", self.id),
            model: model.to_string(),
            content: "ok".to_string(),
            finish_reason: Some("stop".to_string()),
            prompt_tokens: 20_000,
            completion_tokens: 10_000,
            total_tokens: 30_000,
            raw: serde_json::json!({}),
        })
    }

    fn provider_id(&self) -> &str {
        self.id
    }
}

fn config() -> GatewayConfig {
    GatewayConfig::from_toml_str(
        r#"
        [routing.retry]
        retry_delay_ms = 0
        max_retries = 2
        "#,
    )
    .unwrap()
}

fn request(task_type: &str, session: &str) -> LLMRequest {
    LLMRequest::new(Some(task_type.to_string()), vec![ChatMessage::user("design a cache")])
        .with_caller("user-7", Some(session.to_string()))
}

#[tokio::test]
async fn routes_with_fallback_and_accounts_usage() {
    let config = config();
    let (registry, table) = config.build_tables().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let accountant = Arc::new(CostAccountant::new(store.clone(), config.budget.clone()));

    let deepseek = ScriptedClient::new("deepseek", false);
    let openai = ScriptedClient::new("openai", true);
    let router = LLMRouter::new(
        Arc::new(table),
        Arc::new(registry),
        config.routing.retry.clone(),
        store.clone(),
    )
    .with_client(deepseek.clone())
    .with_client(openai.clone())
    .with_accountant(accountant.clone());

    let response = router.route(&request("architectural_design", "s-1")).await.unwrap();
    assert_eq!(deepseek.calls.load(Ordering::SeqCst), 2);
    assert_eq!(openai.calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.routing_info.task_type, TaskType::ArchitecturalDesign);
    assert_eq!(response.model, "gpt-4o");
    // 20k input at $0.0025/1k plus 10k output at $0.01/1k
    assert!((response.usage.estimated_cost - 0.15).abs() < 1e-9);

    let logs = store.recent_logs(10, 0, &LogFilters::default()).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs.iter().filter(|l| l.status_code == 429).count(), 2);

    // Second request pushes the session past 80% of 50k tokens
    router.route(&request("general_chat", "s-1")).await.unwrap();
    let status = accountant.check_budget("user-7", Some("s-1"), Utc::now()).await.unwrap();
    assert_eq!(status.session_usage, 60_000);
    assert_eq!(status.query_usage, 30_000);
    assert!(status.warnings.contains(&BudgetWarning::SessionApproachingLimit));
    assert!(!status.warnings.contains(&BudgetWarning::UserApproachingLimit));

    let metrics = store.aggregated_metrics(TimeRange::LastHour).await.unwrap();
    assert_eq!(metrics.total_requests, 6);
    assert_eq!(metrics.successful_requests, 2);
}

#[tokio::test]
async fn unavailable_when_both_providers_fail() {
    let config = config();
    let (registry, table) = config.build_tables().unwrap();
    let store = Arc::new(InMemoryStore::new());

    let router = LLMRouter::new(Arc::new(table), Arc::new(registry), config.routing.retry.clone(), store.clone())
        .with_client(ScriptedClient::new("deepseek", false))
        .with_client(ScriptedClient::new("openai", false));

    let err = router.route(&request("not_a_task", "s-2")).await.unwrap_err();
    assert!(matches!(err, GatewayError::GatewayUnavailable { .. }));
    assert_eq!(err.status_code(), 503);
    assert_eq!(store.log_count().await, 3);
    assert_eq!(store.cost_record_count().await, 0);
}

#[tokio::test]
async fn sqlite_backend_serves_the_same_flow() {
    let config = config();
    let (registry, table) = config.build_tables().unwrap();
    let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
    store.init().await.unwrap();
    let accountant = Arc::new(CostAccountant::new(store.clone(), config.budget.clone()));

    let router = LLMRouter::new(Arc::new(table), Arc::new(registry), config.routing.retry.clone(), store.clone())
        .with_client(ScriptedClient::new("deepseek", true))
        .with_client(ScriptedClient::new("openai", true))
        .with_accountant(accountant.clone());

    router.route(&request("code_generation", "s-3")).await.unwrap();

    assert_eq!(accountant.session_total("user-7", "s-3").await.unwrap(), 30_000);
    let latest = store.latest_session_record("user-7", "s-3").await.unwrap().unwrap();
    assert_eq!(latest.model, "deepseek-chat");

    let stats = store.provider_stats(TimeRange::LastDay).await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].provider_id, "deepseek");
    assert_eq!(stats[0].success_count, 1);
}
