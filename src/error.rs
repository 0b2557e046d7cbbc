//! Error types for the conductor.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::types::openai::FieldIssue;

/// Conductor error taxonomy.
///
/// Each variant maps to a fixed user-visible status code; upstream faults
/// carry the last provider message so clients can see what the provider said.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Zero enabled keys at request time
    #[error("No providers configured. Add API keys to config/config.yaml")]
    NoProviders,

    /// RESERVE wait exceeded the request timeout
    #[error("Request timed out waiting for available capacity")]
    CapacityTimeout,

    /// Provider returned a non-429 4xx; retrying elsewhere will not help
    #[error("{message}")]
    UpstreamClient { status: u16, message: String },

    /// All retries yielded 5xx / 429 / network errors
    #[error("{message}")]
    UpstreamServer { message: String },

    /// Inbound body failed validation
    #[error("Invalid request body")]
    BadRequest { issues: Vec<FieldIssue> },
}

impl ConductorError {
    /// Build an upstream server fault from any displayable error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamServer { message: message.into() }
    }
}

impl IntoResponse for ConductorError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ConductorError::NoProviders => {
                (StatusCode::SERVICE_UNAVAILABLE, json!(self.to_string()))
            }
            ConductorError::CapacityTimeout => {
                (StatusCode::GATEWAY_TIMEOUT, json!(self.to_string()))
            }
            ConductorError::UpstreamClient { status, message } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
                json!(message),
            ),
            ConductorError::UpstreamServer { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!(message))
            }
            ConductorError::BadRequest { issues } => {
                (StatusCode::UNPROCESSABLE_ENTITY, json!(issues))
            }
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
