//! OpenAI-compatible API types.
//!
//! These types provide compatibility with the OpenAI Chat Completions API,
//! allowing existing OpenAI clients to talk to the conductor unchanged.
//! The conductor adds three inbound extensions (`provider`, `priority` and
//! unified model names) and two outbound extensions (`provider`,
//! `provider_key_name`).
//!
//! Reference: https://platform.openai.com/docs/api-reference/chat

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default unified model when a request does not name one.
pub const DEFAULT_MODEL: &str = "llama-70b";

/// Maximum number of pass-through extension fields accepted on a request.
pub const MAX_EXTENSION_FIELDS: usize = 16;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user" or "assistant"
    pub role: Role,

    /// Message content
    pub content: String,
}

/// Request body for POST /v1/chat/completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Unified model name (e.g. "llama-70b"); defaults to [`DEFAULT_MODEL`].
    /// Provider-native names pass through unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Messages in the conversation
    pub messages: Vec<ChatMessage>,

    /// Sampling temperature (0.0-2.0), default 0.7
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate, default 1024
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling parameter, (0, 1], default 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Streaming is not supported; `true` is rejected at validation.
    #[serde(default)]
    pub stream: bool,

    /// Conductor extension: force a specific provider (e.g. "cerebras")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Conductor extension: request priority (0-10). Accepted for wire
    /// compatibility; does not influence scheduling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    /// Bounded pass-through map for forward-compatible fields; forwarded to
    /// the upstream body verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChatCompletionRequest {
    /// Resolved temperature with the conductor default applied.
    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(0.7)
    }

    /// Resolved max_tokens with the conductor default applied.
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(1024)
    }

    /// Resolved top_p with the conductor default applied.
    pub fn top_p(&self) -> f32 {
        self.top_p.unwrap_or(1.0)
    }

    /// Unified model name with the conductor default applied.
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Validate the request, returning field-level issues for a 422.
    pub fn validate(&self) -> Vec<FieldIssue> {
        let mut issues = Vec::new();

        if self.messages.is_empty() {
            issues.push(FieldIssue::new("messages", "must contain at least one message"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                issues.push(FieldIssue::new("temperature", "must be between 0 and 2"));
            }
        }
        if let Some(m) = self.max_tokens {
            if m < 1 {
                issues.push(FieldIssue::new("max_tokens", "must be a positive integer"));
            }
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                issues.push(FieldIssue::new("top_p", "must be in (0, 1]"));
            }
        }
        if self.stream {
            issues.push(FieldIssue::new("stream", "streaming responses are not supported"));
        }
        if let Some(p) = self.priority {
            if p > 10 {
                issues.push(FieldIssue::new("priority", "must be between 0 and 10"));
            }
        }
        if self.extra.len() > MAX_EXTENSION_FIELDS {
            issues.push(FieldIssue::new("body", "too many extension fields"));
        }

        issues
    }
}

/// A single field-level validation issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldIssue {
    /// Offending field
    pub field: String,

    /// Human-readable explanation
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

/// Completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Index of this choice
    pub index: u32,

    /// Generated message
    pub message: ChatMessage,

    /// Reason generation stopped
    pub finish_reason: Option<String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,

    /// Total tokens
    pub total_tokens: u32,
}

/// Response from POST /v1/chat/completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Unique ID for this completion
    pub id: String,

    /// Object type (always "chat.completion")
    pub object: String,

    /// Unix timestamp
    pub created: i64,

    /// Model that served the request (provider-native name)
    pub model: String,

    /// Completion choices
    pub choices: Vec<Choice>,

    /// Token usage, when the provider reported it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Conductor extension: provider that served the call
    pub provider: String,

    /// Conductor extension: name of the key the call was billed to
    pub provider_key_name: String,

    /// Provider fields we do not model, passed through unchanged
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Request body for POST /v1/batch/chat/completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Independent chat requests, dispatched concurrently
    pub requests: Vec<ChatCompletionRequest>,

    /// When false, return once a majority (>50%) complete; the rest are
    /// cancelled.
    #[serde(default = "default_wait_for_all")]
    pub wait_for_all: bool,
}

fn default_wait_for_all() -> bool {
    true
}

/// A failed position in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Index into the input `requests`
    pub index: usize,

    /// Error message for that position
    pub error: String,
}

/// Response for POST /v1/batch/chat/completions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Aligned with the input order; `null` where the request failed or was
    /// cancelled.
    pub responses: Vec<Option<ChatCompletionResponse>>,

    /// Failed positions with error messages (unordered)
    pub failed: Vec<BatchFailure>,

    /// Wall time from first dispatch to last completion
    pub total_time_ms: f64,
}

/// Status of a single provider key, one row of GET /status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStatus {
    /// Provider identifier
    pub provider: String,

    /// Friendly key name
    pub key_name: String,

    /// Requests left in the current window
    pub requests_remaining: u32,

    /// Tokens left in the current window
    pub tokens_remaining: u64,

    /// Configured request budget per minute
    pub requests_per_minute: u32,

    /// Configured token budget per minute
    pub tokens_per_minute: u64,

    /// Wall-clock instant the window refills
    pub reset_at: DateTime<Utc>,

    /// True iff both counters are positive and the key is not cooling down
    pub is_available: bool,
}

/// Overall conductor status, GET /status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorStatus {
    pub status: String,
    pub scheduling_strategy: String,
    pub total_providers: usize,
    pub total_keys: usize,
    pub available_keys: usize,
    pub providers: Vec<KeyStatus>,
}

/// One entry of GET /v1/models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Unified model name
    pub id: String,

    /// Object type (always "model")
    pub object: String,
}

/// Response from GET /v1/models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Object type (always "list")
    pub object: String,

    /// Unified model names the registry knows
    pub data: Vec<ModelEntry>,

    /// Model used when a request names none
    pub default_model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request(json: &str) -> ChatCompletionRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_request_defaults() {
        let request = minimal_request(
            r#"{"messages": [{"role": "user", "content": "Hello!"}]}"#,
        );

        assert_eq!(request.model(), "llama-70b");
        assert_eq!(request.max_tokens(), 1024);
        assert!((request.temperature() - 0.7).abs() < f32::EPSILON);
        assert!((request.top_p() - 1.0).abs() < f32::EPSILON);
        assert!(!request.stream);
        assert!(request.validate().is_empty());
    }

    #[test]
    fn test_forced_provider_and_extensions() {
        let request = minimal_request(
            r#"{
                "messages": [{"role": "user", "content": "hi"}],
                "provider": "nvidia",
                "seed": 42,
                "frequency_penalty": 0.5
            }"#,
        );

        assert_eq!(request.provider.as_deref(), Some("nvidia"));
        // Unknown fields land in the extension map, typed fields do not.
        assert_eq!(request.extra.len(), 2);
        assert!(request.extra.contains_key("seed"));
        assert!(!request.extra.contains_key("provider"));
    }

    #[test]
    fn test_validation_issues() {
        let request = minimal_request(
            r#"{
                "messages": [],
                "temperature": 3.5,
                "top_p": 0.0,
                "stream": true
            }"#,
        );

        let issues = request.validate();
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert!(fields.contains(&"messages"));
        assert!(fields.contains(&"temperature"));
        assert!(fields.contains(&"top_p"));
        assert!(fields.contains(&"stream"));
    }

    #[test]
    fn test_response_carries_conductor_fields() {
        let response = ChatCompletionResponse {
            id: "chatcmpl-test".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: "llama-3.3-70b".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage { role: Role::Assistant, content: "hi".to_string() },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage { prompt_tokens: 3, completion_tokens: 1, total_tokens: 4 }),
            provider: "cerebras".to_string(),
            provider_key_name: "cerebras-key-1".to_string(),
            extra: BTreeMap::new(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""provider":"cerebras""#));
        assert!(json.contains(r#""provider_key_name":"cerebras-key-1""#));
    }

    #[test]
    fn test_batch_request_default_wait() {
        let batch: BatchRequest =
            serde_json::from_str(r#"{"requests": []}"#).unwrap();
        assert!(batch.wait_for_all);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
