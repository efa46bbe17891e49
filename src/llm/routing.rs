//! Routing table
//!
//! Maps a task type to a primary and a fallback provider/model pair. The table
//! is built once from configuration and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::registry::ProviderRegistry;
use super::TaskType;
use crate::{GatewayError, Result};

/// A provider/model pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Routing rule for one task type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingRule {
    pub task_type: TaskType,
    pub primary: ModelRef,
    pub fallback: ModelRef,
}

/// Retry, timeout and health parameters applied by the router
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts against the first pair before falling back
    pub max_retries: u32,
    /// Fixed delay between consecutive attempts on the same pair
    pub retry_delay_ms: u64,
    /// Upper bound for a single upstream call
    pub timeout_ms: u64,
    /// Consecutive failures after which a provider is degraded
    pub max_consecutive_failures: u32,
    /// How long a degraded provider is avoided before it is probed again
    pub degraded_cooldown_ms: u64,
}

impl RetryPolicy {
    /// Attempts made against the first pair; zero still means one attempt
    pub fn primary_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 1000,
            timeout_ms: 30_000,
            max_consecutive_failures: 3,
            degraded_cooldown_ms: 60_000,
        }
    }
}

/// Validated, immutable routing table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: BTreeMap<TaskType, RoutingRule>,
}

impl RoutingTable {
    /// Build the table, failing fast on any inconsistency
    ///
    /// ## Errors
    /// - two rules for the same task type
    /// - no `default` rule
    /// - a pair referencing an unknown provider or an undeclared model
    pub fn from_rules(rules: Vec<RoutingRule>, registry: &ProviderRegistry) -> Result<Self> {
        let mut table = BTreeMap::new();

        for rule in rules {
            for pair in [&rule.primary, &rule.fallback] {
                let provider = registry.get(&pair.provider).ok_or_else(|| {
                    GatewayError::Config(format!(
                        "rule '{}' references unknown provider '{}'",
                        rule.task_type, pair.provider
                    ))
                })?;
                if !provider.supports_model(&pair.model) {
                    return Err(GatewayError::Config(format!(
                        "rule '{}' references model '{}' not declared by provider '{}'",
                        rule.task_type, pair.model, pair.provider
                    )));
                }
            }

            if table.contains_key(&rule.task_type) {
                return Err(GatewayError::Config(format!(
                    "duplicate routing rule for task type '{}'",
                    rule.task_type
                )));
            }
            debug!(
                "Routing rule {}: {} -> {}",
                rule.task_type, rule.primary, rule.fallback
            );
            table.insert(rule.task_type, rule);
        }

        if !table.contains_key(&TaskType::Default) {
            return Err(GatewayError::Config(
                "routing table has no 'default' rule".to_string(),
            ));
        }

        Ok(Self { rules: table })
    }

    /// Rule for a task type; anything without a dedicated rule gets `default`
    pub fn resolve(&self, task_type: &str) -> &RoutingRule {
        TaskType::parse(task_type)
            .and_then(|task| self.rules.get(&task))
            .unwrap_or_else(|| self.default_rule())
    }

    pub fn default_rule(&self) -> &RoutingRule {
        // Presence is checked in `from_rules`.
        &self.rules[&TaskType::Default]
    }

    pub fn rules(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
