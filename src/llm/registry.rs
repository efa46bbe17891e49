//! Provider registry
//!
//! Static list of upstream LLM providers, validated once at startup. Routing
//! rules may only reference providers and models declared here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

use crate::{GatewayError, Result};

/// Per-model token pricing, in USD per 1000 tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub model: String,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

/// An upstream provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub models: Vec<String>,
    /// Name of the environment variable holding the API key
    #[serde(default, skip_serializing)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub pricing: Vec<ModelPricing>,
}

impl ProviderConfig {
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn pricing_for(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing.iter().find(|p| p.model == model)
    }
}

/// Immutable lookup of providers keyed by id
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
    order: Vec<String>,
}

impl ProviderRegistry {
    /// Validate and index the provider list
    ///
    /// Rejects duplicate ids, empty model lists, unparseable base URLs and
    /// pricing entries for undeclared models.
    pub fn new(providers: Vec<ProviderConfig>) -> Result<Self> {
        let mut index = HashMap::new();
        let mut order = Vec::with_capacity(providers.len());

        for provider in providers {
            if provider.id.trim().is_empty() {
                return Err(GatewayError::Config("provider id must not be empty".to_string()));
            }
            if index.contains_key(&provider.id) {
                return Err(GatewayError::Config(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.models.is_empty() {
                return Err(GatewayError::Config(format!(
                    "provider '{}' declares no models",
                    provider.id
                )));
            }

            let url = Url::parse(&provider.base_url).map_err(|e| {
                GatewayError::Config(format!(
                    "provider '{}' has invalid base_url '{}': {}",
                    provider.id, provider.base_url, e
                ))
            })?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(GatewayError::Config(format!(
                    "provider '{}' base_url must be http(s), got '{}'",
                    provider.id,
                    url.scheme()
                )));
            }

            for pricing in &provider.pricing {
                if !provider.supports_model(&pricing.model) {
                    return Err(GatewayError::Config(format!(
                        "provider '{}' prices undeclared model '{}'",
                        provider.id, pricing.model
                    )));
                }
                if pricing.input_cost_per_1k < 0.0 || pricing.output_cost_per_1k < 0.0 {
                    return Err(GatewayError::Config(format!(
                        "provider '{}' has negative pricing for '{}'",
                        provider.id, pricing.model
                    )));
                }
            }

            debug!("Registered provider {} ({} models)", provider.id, provider.models.len());
            order.push(provider.id.clone());
            index.insert(provider.id.clone(), provider);
        }

        Ok(Self {
            providers: index,
            order,
        })
    }

    pub fn get(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.get(id)
    }

    pub fn has_model(&self, provider_id: &str, model: &str) -> bool {
        self.get(provider_id)
            .map(|p| p.supports_model(model))
            .unwrap_or(false)
    }

    /// Providers in declaration order
    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.order.iter().filter_map(|id| self.providers.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Cost in USD of a completion; unknown models cost nothing
    pub fn estimate_cost(
        &self,
        provider_id: &str,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> f64 {
        self.get(provider_id)
            .and_then(|p| p.pricing_for(model))
            .map(|pricing| {
                (prompt_tokens as f64 / 1000.0) * pricing.input_cost_per_1k
                    + (completion_tokens as f64 / 1000.0) * pricing.output_cost_per_1k
            })
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn provider(id: &str, models: &[&str]) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            base_url: format!("https://{}.example.com/v1", id),
            models: models.iter().map(|m| m.to_string()).collect(),
            api_key_env: None,
            pricing: Vec::new(),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new(vec![
            provider("deepseek", &["deepseek-chat"]),
            provider("openai", &["gpt-4o", "gpt-4o-mini"]),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.has_model("openai", "gpt-4o-mini"));
        assert!(!registry.has_model("openai", "deepseek-chat"));
        assert!(!registry.has_model("mistral", "gpt-4o"));

        let ids: Vec<_> = registry.providers().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["deepseek", "openai"]);
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let result = ProviderRegistry::new(vec![
            provider("openai", &["gpt-4o"]),
            provider("openai", &["gpt-4o-mini"]),
        ]);
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let mut bad = provider("openai", &["gpt-4o"]);
        bad.base_url = "not a url".to_string();
        assert!(ProviderRegistry::new(vec![bad.clone()]).is_err());

        bad.base_url = "ftp://files.example.com".to_string();
        assert!(ProviderRegistry::new(vec![bad]).is_err());
    }

    #[test]
    fn test_empty_models_rejected() {
        assert!(ProviderRegistry::new(vec![provider("openai", &[])]).is_err());
    }

    #[test]
    fn test_cost_estimate() {
        let mut openai = provider("openai", &["gpt-4o", "gpt-4o-mini"]);
        openai.pricing.push(ModelPricing {
            model: "gpt-4o".to_string(),
            input_cost_per_1k: 0.0025,
            output_cost_per_1k: 0.01,
        });
        let registry = ProviderRegistry::new(vec![openai]).unwrap();

        let cost = registry.estimate_cost("openai", "gpt-4o", 2000, 500);
        assert!((cost - 0.01).abs() < 1e-12);
        assert_eq!(registry.estimate_cost("openai", "gpt-4o-mini", 2000, 500), 0.0);
        assert_eq!(registry.estimate_cost("nobody", "gpt-4o", 2000, 500), 0.0);
    }

    #[test]
    fn test_pricing_for_undeclared_model_rejected() {
        let mut openai = provider("openai", &["gpt-4o"]);
        openai.pricing.push(ModelPricing {
            model: "gpt-5".to_string(),
            input_cost_per_1k: 0.1,
            output_cost_per_1k: 0.1,
        });
        assert!(ProviderRegistry::new(vec![openai]).is_err());
    }
}
