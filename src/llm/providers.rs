// LLM Provider implementations
// Clients that talk to upstream OpenAI-compatible chat completion APIs

use async_trait::async_trait;
use reqwest::{header::HeaderMap, header::HeaderValue, header::AUTHORIZATION, header::CONTENT_TYPE, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::registry::{ProviderConfig, ProviderRegistry};
use super::{ChatMessage, LLMError, LLMRequest, LLMResult, ProviderCompletion};

#[async_trait]
pub trait LLMProviderClient: Send + Sync {
    /// Send a chat completion request for `model`
    async fn chat_completion(&self, model: &str, request: &LLMRequest) -> LLMResult<ProviderCompletion>;

    /// Id of the provider this client talks to
    fn provider_id(&self) -> &str;
}

/// Request body of `POST {base_url}/chat/completions`
#[derive(Debug, Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    id: String,
    model: String,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

/// Client for any provider speaking the OpenAI chat completions dialect
pub struct OpenAICompatibleClient {
    client: Client,
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAICompatibleClient {
    pub fn new(provider_id: impl Into<String>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Build a client from registry config, reading the key from `api_key_env`
    pub fn from_config(config: &ProviderConfig) -> Self {
        let api_key = config.api_key_env.as_ref().and_then(|var| match std::env::var(var) {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                warn!("Provider {}: {} is not set", config.id, var);
                None
            }
        });
        Self::new(config.id.clone(), config.base_url.clone(), api_key)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Build HTTP headers for requests
    fn build_headers(&self) -> LLMResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| LLMError::AuthenticationFailed(format!("Invalid API key format: {}", e)))?,
            );
        }
        Ok(headers)
    }
}

#[async_trait]
impl LLMProviderClient for OpenAICompatibleClient {
    async fn chat_completion(&self, model: &str, request: &LLMRequest) -> LLMResult<ProviderCompletion> {
        let payload = OpenAIChatRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
            user: request.user_id.as_deref(),
        };

        debug!("POST {} model={}", self.endpoint(), model);

        let response = self
            .client
            .post(self.endpoint())
            .headers(self.build_headers()?)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LLMError::Timeout(e.to_string())
                } else {
                    LLMError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(match status.as_u16() {
                401 | 403 => LLMError::AuthenticationFailed(error_text),
                429 => LLMError::RateLimitExceeded(error_text),
                400 => LLMError::InvalidRequest(error_text),
                code => LLMError::Upstream {
                    status: code,
                    message: error_text,
                },
            });
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::Serialization(e.to_string()))?;
        parse_completion(raw)
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

/// Convert an OpenAI-style response body into a completion
fn parse_completion(raw: serde_json::Value) -> LLMResult<ProviderCompletion> {
    let parsed: OpenAIChatResponse =
        serde_json::from_value(raw.clone()).map_err(|e| LLMError::Serialization(e.to_string()))?;

    let first = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LLMError::Serialization("response contained no choices".to_string()))?;
    let usage = parsed.usage.unwrap_or_default();

    Ok(ProviderCompletion {
        id: parsed.id,
        model: parsed.model,
        content: first.message.content.unwrap_or_default(),
        finish_reason: first.finish_reason,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens.saturating_add(usage.completion_tokens)
        },
        raw,
    })
}

/// One client per registered provider
pub fn create_provider_clients(registry: &ProviderRegistry) -> HashMap<String, Arc<dyn LLMProviderClient>> {
    registry
        .providers()
        .map(|config| {
            let client: Arc<dyn LLMProviderClient> = Arc::new(OpenAICompatibleClient::from_config(config));
            (config.id.clone(), client)
        })
        .collect()
}
