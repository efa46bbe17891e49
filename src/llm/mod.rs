//! LLM Gateway Routing and Accounting
//!
//! This module provides the core infrastructure of the gateway: the static
//! routing and provider tables, the router that applies the retry/fallback
//! protocol, the per-provider circuit breaker, cost accounting and the
//! gateway log model.

pub mod cost;
pub mod gateway_log;
pub mod health;
pub mod providers;
pub mod registry;
pub mod router;
pub mod routing;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use routing::ModelRef;

/// Classification of an inbound request used to select a routing rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CodeGeneration,
    ArchitecturalDesign,
    GeneralChat,
    ContentSynthesis,
    ComplexReasoning,
    Default,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::CodeGeneration,
        TaskType::ArchitecturalDesign,
        TaskType::GeneralChat,
        TaskType::ContentSynthesis,
        TaskType::ComplexReasoning,
        TaskType::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CodeGeneration => "code_generation",
            TaskType::ArchitecturalDesign => "architectural_design",
            TaskType::GeneralChat => "general_chat",
            TaskType::ContentSynthesis => "content_synthesis",
            TaskType::ComplexReasoning => "complex_reasoning",
            TaskType::Default => "default",
        }
    }

    /// Parse a task type, returning `None` for unrecognized values
    pub fn parse(value: &str) -> Option<TaskType> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|task| task.as_str() == value.trim())
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message roles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// Chat message structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// A request entering the gateway
///
/// The model is not chosen by the caller: the router picks it from the
/// routing rule matching `task_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMRequest {
    pub id: Uuid,
    pub task_type: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl LLMRequest {
    pub fn new(task_type: Option<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            messages,
            temperature: None,
            max_tokens: None,
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_caller(mut self, user_id: impl Into<String>, session_id: Option<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.session_id = session_id;
        self
    }
}

/// Raw completion returned by a provider client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCompletion {
    pub id: String,
    pub model: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Provider response body, kept for the gateway log
    pub raw: serde_json::Value,
}

/// Token usage information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub estimated_cost: f64,
}

/// Routing information attached to every routed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub task_type: TaskType,
    pub selected: ModelRef,
    pub attempts: u32,
    pub fallback_used: bool,
    pub latency_ms: u64,
}

/// LLM Response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub id: String,
    pub request_id: Uuid,
    pub model: String,
    pub provider: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
    pub routing_info: RoutingInfo,
}

/// Error types for a single upstream attempt
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Rate limit exceeded for provider: {0}")]
    RateLimitExceeded(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LLMError {
    /// Status code written to the gateway log for a failed attempt
    pub fn status_code(&self) -> u16 {
        match self {
            LLMError::ProviderNotFound(_) => 404,
            LLMError::RateLimitExceeded(_) => 429,
            LLMError::AuthenticationFailed(_) => 401,
            LLMError::Timeout(_) => 504,
            LLMError::InvalidRequest(_) => 400,
            LLMError::Upstream { status, .. } => *status,
            LLMError::Network(_) | LLMError::Serialization(_) => 502,
        }
    }
}

/// Result type for LLM operations
pub type LLMResult<T> = Result<T, LLMError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_parse() {
        assert_eq!(TaskType::parse("code_generation"), Some(TaskType::CodeGeneration));
        assert_eq!(TaskType::parse(" general_chat "), Some(TaskType::GeneralChat));
        assert_eq!(TaskType::parse("default"), Some(TaskType::Default));
        assert_eq!(TaskType::parse("poetry"), None);
        assert_eq!(TaskType::parse(""), None);
    }

    #[test]
    fn test_task_type_serde_matches_as_str() {
        for task in TaskType::ALL {
            let json = serde_json::to_string(&task).unwrap();
            assert_eq!(json, format!("\"{}\"", task.as_str()));
        }
    }

    #[test]
    fn test_llm_error_status_codes() {
        assert_eq!(LLMError::Timeout("30s".into()).status_code(), 504);
        assert_eq!(LLMError::RateLimitExceeded("x".into()).status_code(), 429);
        assert_eq!(
            LLMError::Upstream {
                status: 503,
                message: "overloaded".into()
            }
            .status_code(),
            503
        );
        assert_eq!(LLMError::Network("reset".into()).status_code(), 502);
    }
}
