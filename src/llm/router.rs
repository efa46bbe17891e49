//! Failure/fallback router
//!
//! Runs one request through its routing rule:
//!
//! 1. resolve the rule for the request's task type (unknown types use `default`)
//! 2. try the primary pair up to `max_retries` times, sequentially, waiting
//!    `retry_delay_ms` between attempts
//! 3. try the fallback pair once
//! 4. give up with [`GatewayError::GatewayUnavailable`]
//!
//! When the primary provider is degraded and the fallback is not, the order is
//! swapped: the fallback gets the retries and the primary the single attempt.
//!
//! Every attempt, successful or not, produces one gateway log record.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::cost::{CostAccountant, CostRecord, OperationType};
use super::gateway_log::GatewayLogRecord;
use super::health::HealthTracker;
use super::providers::{create_provider_clients, LLMProviderClient};
use super::registry::ProviderRegistry;
use super::routing::{ModelRef, RetryPolicy, RoutingRule, RoutingTable};
use super::{LLMError, LLMRequest, LLMResponse, LLMResult, ProviderCompletion, RoutingInfo, TokenUsage};
use crate::storage::GatewayLogStore;
use crate::{GatewayError, Result};

/// Which half of a routing rule an attempt targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Primary,
    Fallback,
}

pub struct LLMRouter {
    table: Arc<RoutingTable>,
    registry: Arc<ProviderRegistry>,
    policy: RetryPolicy,
    clients: HashMap<String, Arc<dyn LLMProviderClient>>,
    health: Arc<HealthTracker>,
    logs: Arc<dyn GatewayLogStore>,
    accountant: Option<Arc<CostAccountant>>,
}

impl LLMRouter {
    /// Create a router with one HTTP client per registered provider
    pub fn new(
        table: Arc<RoutingTable>,
        registry: Arc<ProviderRegistry>,
        policy: RetryPolicy,
        logs: Arc<dyn GatewayLogStore>,
    ) -> Self {
        let clients = create_provider_clients(&registry);
        let health = Arc::new(HealthTracker::new(
            policy.max_consecutive_failures,
            policy.degraded_cooldown_ms,
        ));
        Self {
            table,
            registry,
            policy,
            clients,
            health,
            logs,
            accountant: None,
        }
    }

    /// Replace the client for `client.provider_id()`
    pub fn with_client(mut self, client: Arc<dyn LLMProviderClient>) -> Self {
        self.clients.insert(client.provider_id().to_string(), client);
        self
    }

    pub fn with_clients(mut self, clients: HashMap<String, Arc<dyn LLMProviderClient>>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = health;
        self
    }

    /// Record a routing cost for every successful request carrying user and session ids
    pub fn with_accountant(mut self, accountant: Arc<CostAccountant>) -> Self {
        self.accountant = Some(accountant);
        self
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Route a request through the retry/fallback protocol
    pub async fn route(&self, request: &LLMRequest) -> Result<LLMResponse> {
        let started = Instant::now();
        let rule = self.table.resolve(request.task_type.as_deref().unwrap_or_default());

        let (first, second) = self.attempt_order(rule);
        info!(
            "Routing request {} ({}) via {} then {}",
            request.id,
            rule.task_type,
            rule_pair(rule, first),
            rule_pair(rule, second)
        );

        let mut attempts = 0;
        let mut first_error = None;

        for attempt in 1..=self.policy.primary_attempts() {
            if attempt > 1 && self.policy.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.policy.retry_delay_ms)).await;
            }
            attempts += 1;
            let target = rule_pair(rule, first);
            match self.attempt(request, rule, target).await {
                Ok(completion) => {
                    return self
                        .complete(request, rule, first, completion, attempts, started)
                        .await;
                }
                Err(e) => {
                    warn!("Attempt {} on {} failed: {}", attempt, target, e);
                    first_error = Some(e);
                }
            }
        }

        attempts += 1;
        let target = rule_pair(rule, second);
        match self.attempt(request, rule, target).await {
            Ok(completion) => {
                self.complete(request, rule, second, completion, attempts, started)
                    .await
            }
            Err(second_error) => {
                error!(
                    "Request {} failed on both {} and {}",
                    request.id, rule.primary, rule.fallback
                );
                let first_error = first_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "not attempted".to_string());
                let second_error = second_error.to_string();
                let (primary, fallback) = match first {
                    Role::Primary => (first_error, second_error),
                    Role::Fallback => (second_error, first_error),
                };
                Err(GatewayError::GatewayUnavailable { primary, fallback })
            }
        }
    }

    fn attempt_order(&self, rule: &RoutingRule) -> (Role, Role) {
        let primary_degraded = self.health.is_degraded(&rule.primary.provider);
        let fallback_degraded = self.health.is_degraded(&rule.fallback.provider);
        if primary_degraded && !fallback_degraded {
            debug!(
                "Provider {} is degraded, starting with fallback {}",
                rule.primary.provider, rule.fallback
            );
            (Role::Fallback, Role::Primary)
        } else {
            (Role::Primary, Role::Fallback)
        }
    }

    /// One bounded upstream call, logged and fed to the health tracker
    async fn attempt(
        &self,
        request: &LLMRequest,
        rule: &RoutingRule,
        target: &ModelRef,
    ) -> LLMResult<ProviderCompletion> {
        let created_at = Utc::now();
        let started = Instant::now();

        let result = match self.clients.get(&target.provider) {
            Some(client) => {
                let limit = Duration::from_millis(self.policy.timeout_ms);
                match tokio::time::timeout(limit, client.chat_completion(&target.model, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LLMError::Timeout(format!(
                        "{} did not answer within {}ms",
                        target, self.policy.timeout_ms
                    ))),
                }
            }
            None => Err(LLMError::ProviderNotFound(target.provider.clone())),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let cost_usd = match &result {
            Ok(completion) => {
                self.health.record_success(&target.provider);
                self.registry.estimate_cost(
                    &target.provider,
                    &target.model,
                    completion.prompt_tokens,
                    completion.completion_tokens,
                )
            }
            Err(e) => {
                self.health.record_failure(&target.provider, e);
                0.0
            }
        };

        let record = GatewayLogRecord {
            request_id: request.id,
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            // As sent by the caller; unrecognized values stay visible
            task_type: request.task_type.clone(),
            provider_id: target.provider.clone(),
            model_id: target.model.clone(),
            request_payload: json!({
                "routed_task_type": rule.task_type.as_str(),
                "model": target.model,
                "messages": request.messages,
                "temperature": request.temperature,
                "max_tokens": request.max_tokens,
            }),
            response_payload: match &result {
                Ok(completion) => completion.raw.clone(),
                Err(e) => json!({ "error": e.to_string() }),
            },
            latency_ms,
            cost_usd,
            status_code: match &result {
                Ok(_) => 200,
                Err(e) => e.status_code(),
            },
            error_message: result.as_ref().err().map(|e| e.to_string()),
            created_at,
        };

        // Logging never fails the request
        if let Err(e) = self.logs.append(&record).await {
            warn!("Failed to write gateway log for request {}: {}", request.id, e);
        }

        result
    }

    async fn complete(
        &self,
        request: &LLMRequest,
        rule: &RoutingRule,
        role: Role,
        completion: ProviderCompletion,
        attempts: u32,
        started: Instant,
    ) -> Result<LLMResponse> {
        let target = rule_pair(rule, role);
        let estimated_cost = self.registry.estimate_cost(
            &target.provider,
            &target.model,
            completion.prompt_tokens,
            completion.completion_tokens,
        );

        if let (Some(accountant), Some(user_id), Some(session_id)) =
            (&self.accountant, &request.user_id, &request.session_id)
        {
            let record = CostRecord {
                user_id: user_id.clone(),
                session_id: session_id.clone(),
                query_id: request.id.to_string(),
                model: target.model.clone(),
                prompt_tokens: completion.prompt_tokens as i64,
                completion_tokens: completion.completion_tokens as i64,
                total_tokens: completion.total_tokens as i64,
                cost_usd: estimated_cost,
                operation_type: OperationType::Routing,
                created_at: Utc::now(),
            };
            if let Err(e) = accountant.record_usage(record).await {
                warn!("Failed to record usage for request {}: {}", request.id, e);
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            "Request {} served by {} after {} attempt(s) in {}ms",
            request.id, target, attempts, latency_ms
        );

        Ok(LLMResponse {
            id: completion.id,
            request_id: request.id,
            model: target.model.clone(),
            provider: target.provider.clone(),
            content: completion.content,
            finish_reason: completion.finish_reason,
            usage: TokenUsage {
                prompt_tokens: completion.prompt_tokens,
                completion_tokens: completion.completion_tokens,
                total_tokens: completion.total_tokens,
                estimated_cost,
            },
            routing_info: RoutingInfo {
                task_type: rule.task_type,
                selected: target.clone(),
                attempts,
                fallback_used: role == Role::Fallback,
                latency_ms,
            },
        })
    }
}

fn rule_pair(rule: &RoutingRule, role: Role) -> &ModelRef {
    match role {
        Role::Primary => &rule.primary,
        Role::Fallback => &rule.fallback,
    }
}
