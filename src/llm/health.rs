//! Per-provider circuit breaker
//!
//! A provider is degraded once it reaches `max_consecutive_failures`
//! consecutive failures. While degraded the router prefers the other pair of a
//! rule. After the cooldown the provider becomes eligible again (half-open);
//! the next success resets it, the next failure degrades it again.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::LLMError;

/// Provider health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealthStatus {
    pub provider_id: String,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub degraded_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_check: DateTime<Utc>,
}

impl ProviderHealthStatus {
    fn new(provider_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            degraded_since: None,
            last_error: None,
            last_check: now,
        }
    }
}

/// Health snapshot returned to dashboards
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealthView {
    #[serde(flatten)]
    pub status: ProviderHealthStatus,
    pub degraded: bool,
}

/// Tracks consecutive failures per provider id
pub struct HealthTracker {
    max_consecutive_failures: u32,
    cooldown: Duration,
    providers: DashMap<String, ProviderHealthStatus>,
}

impl HealthTracker {
    pub fn new(max_consecutive_failures: u32, cooldown_ms: u64) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            cooldown: Duration::milliseconds(cooldown_ms as i64),
            providers: DashMap::new(),
        }
    }

    pub fn record_success(&self, provider_id: &str) {
        self.record_success_at(provider_id, Utc::now());
    }

    pub fn record_success_at(&self, provider_id: &str, now: DateTime<Utc>) {
        let mut status = self
            .providers
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderHealthStatus::new(provider_id, now));

        if status.degraded_since.is_some() {
            info!("Provider {} recovered", provider_id);
        }
        status.consecutive_failures = 0;
        status.total_successes += 1;
        status.degraded_since = None;
        status.last_error = None;
        status.last_check = now;
    }

    pub fn record_failure(&self, provider_id: &str, error: &LLMError) {
        self.record_failure_at(provider_id, error, Utc::now());
    }

    pub fn record_failure_at(&self, provider_id: &str, error: &LLMError, now: DateTime<Utc>) {
        let mut status = self
            .providers
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderHealthStatus::new(provider_id, now));

        status.consecutive_failures += 1;
        status.total_failures += 1;
        status.last_error = Some(error.to_string());
        status.last_check = now;

        if status.consecutive_failures >= self.max_consecutive_failures {
            if status.degraded_since.is_none() {
                warn!(
                    "Provider {} degraded after {} consecutive failures",
                    provider_id, status.consecutive_failures
                );
            }
            // A failed probe restarts the cooldown.
            status.degraded_since = Some(now);
        }
    }

    pub fn is_degraded(&self, provider_id: &str) -> bool {
        self.is_degraded_at(provider_id, Utc::now())
    }

    pub fn is_degraded_at(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.providers
            .get(provider_id)
            .map(|status| self.degraded(&status, now))
            .unwrap_or(false)
    }

    fn degraded(&self, status: &ProviderHealthStatus, now: DateTime<Utc>) -> bool {
        status
            .degraded_since
            .map(|since| now - since < self.cooldown)
            .unwrap_or(false)
    }

    pub fn status(&self, provider_id: &str) -> Option<ProviderHealthStatus> {
        self.providers.get(provider_id).map(|s| s.value().clone())
    }

    /// All tracked providers, sorted by id
    pub fn snapshot(&self) -> Vec<ProviderHealthView> {
        let now = Utc::now();
        let mut views: Vec<_> = self
            .providers
            .iter()
            .map(|entry| ProviderHealthView {
                degraded: self.degraded(entry.value(), now),
                status: entry.value().clone(),
            })
            .collect();
        views.sort_by(|a, b| a.status.provider_id.cmp(&b.status.provider_id));
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> LLMError {
        LLMError::Upstream {
            status: 500,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_degraded_after_threshold() {
        let tracker = HealthTracker::new(3, 60_000);
        let now = Utc::now();

        tracker.record_failure_at("openai", &failure(), now);
        tracker.record_failure_at("openai", &failure(), now);
        assert!(!tracker.is_degraded_at("openai", now));

        tracker.record_failure_at("openai", &failure(), now);
        assert!(tracker.is_degraded_at("openai", now));
        assert!(!tracker.is_degraded_at("deepseek", now));
    }

    #[test]
    fn test_success_resets_counter() {
        let tracker = HealthTracker::new(2, 60_000);
        let now = Utc::now();

        tracker.record_failure_at("openai", &failure(), now);
        tracker.record_failure_at("openai", &failure(), now);
        assert!(tracker.is_degraded_at("openai", now));

        tracker.record_success_at("openai", now);
        assert!(!tracker.is_degraded_at("openai", now));

        let status = tracker.status("openai").unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_failures, 2);
        assert_eq!(status.total_successes, 1);
        assert!(status.last_error.is_none());

        // Counter starts from zero again
        tracker.record_failure_at("openai", &failure(), now);
        assert!(!tracker.is_degraded_at("openai", now));
    }

    #[test]
    fn test_cooldown_half_open() {
        let tracker = HealthTracker::new(1, 1_000);
        let now = Utc::now();

        tracker.record_failure_at("openai", &failure(), now);
        assert!(tracker.is_degraded_at("openai", now + Duration::milliseconds(999)));
        assert!(!tracker.is_degraded_at("openai", now + Duration::milliseconds(1_000)));

        // Failed probe degrades again immediately
        let later = now + Duration::milliseconds(1_500);
        tracker.record_failure_at("openai", &failure(), later);
        assert!(tracker.is_degraded_at("openai", later));
    }

    #[test]
    fn test_snapshot_sorted() {
        let tracker = HealthTracker::new(3, 60_000);
        tracker.record_success("openai");
        tracker.record_failure("deepseek", &failure());

        let snapshot = tracker.snapshot();
        let ids: Vec<_> = snapshot.iter().map(|v| v.status.provider_id.as_str()).collect();
        assert_eq!(ids, vec!["deepseek", "openai"]);
        assert!(snapshot.iter().all(|v| !v.degraded));
    }
}
