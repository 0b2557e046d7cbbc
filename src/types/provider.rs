//! Upstream provider dialect types.
//!
//! Both stock providers speak the OpenAI chat-completions dialect; the
//! outbound body differs from the inbound one in that the model is the
//! provider-native identifier, the conductor extensions are stripped, and
//! the sampling defaults are resolved. The response type is deliberately
//! lenient: only `choices` is required, everything else is optional and
//! backfilled by the dispatcher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::openai::{ChatMessage, Choice, Usage};

/// Outbound body for POST {base_url}/chat/completions.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderChatRequest {
    /// Provider-native model identifier
    pub model: String,

    /// Conversation messages
    pub messages: Vec<ChatMessage>,

    /// Resolved sampling temperature
    pub temperature: f32,

    /// Resolved generation budget
    pub max_tokens: u32,

    /// Resolved nucleus sampling parameter
    pub top_p: f32,

    /// Stop sequences, omitted when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Client extension fields forwarded verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Parsed 2xx provider response. A body without `choices` fails to parse and
/// is treated as an upstream fault.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderChatResponse {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub object: Option<String>,

    #[serde(default)]
    pub created: Option<i64>,

    #[serde(default)]
    pub model: Option<String>,

    pub choices: Vec<Choice>,

    #[serde(default)]
    pub usage: Option<Usage>,

    /// Provider fields we do not model, preserved for the client
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_omits_empty_stop() {
        let body = ProviderChatRequest {
            model: "llama-3.3-70b".to_string(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            stop: None,
            extra: BTreeMap::new(),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("stop").is_none());
        assert_eq!(json["model"], "llama-3.3-70b");
    }

    #[test]
    fn test_response_requires_choices() {
        let missing: Result<ProviderChatResponse, _> =
            serde_json::from_str(r#"{"id": "x", "usage": null}"#);
        assert!(missing.is_err());

        let ok: ProviderChatResponse = serde_json::from_str(
            r#"{
                "id": "chatcmpl-1",
                "choices": [
                    {"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}
                ],
                "system_fingerprint": "fp_x"
            }"#,
        )
        .unwrap();
        assert_eq!(ok.choices.len(), 1);
        assert!(ok.usage.is_none());
        assert!(ok.extra.contains_key("system_fingerprint"));
    }
}
