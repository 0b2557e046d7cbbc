//! OpenAI-compatible API routes.
//!
//! Clients use unified model names like "llama-70b"; the conductor
//! translates them per provider and routes each request to whichever key
//! currently has budget.

use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ConductorError;
use crate::metrics::RequestTimer;
use crate::state::AppState;
use crate::types::openai::{
    BatchRequest, BatchResponse, ChatCompletionRequest, ChatCompletionResponse, FieldIssue,
    ModelEntry, ModelsResponse, DEFAULT_MODEL,
};

/// Chat completions endpoint
///
/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, ConductorError> {
    info!(
        model = %request.model(),
        messages = request.messages.len(),
        forced_provider = request.provider.as_deref(),
        "Handling POST /v1/chat/completions"
    );

    let issues = request.validate();
    if !issues.is_empty() {
        return Err(ConductorError::BadRequest { issues });
    }
    if state.ledger.is_empty() {
        return Err(ConductorError::NoProviders);
    }

    {
        let mut stats = state.stats.lock().await;
        stats.requests_total += 1;
    }

    let timer = RequestTimer::new();
    match state.dispatcher.handle(request).await {
        Ok(response) => {
            let tokens = response
                .usage
                .map(|usage| usage.total_tokens as u64)
                .unwrap_or(0);
            {
                let mut stats = state.stats.lock().await;
                stats.requests_success += 1;
                stats.tokens_consumed += tokens;
            }
            timer.record_success(&response.provider, tokens);
            Ok(Json(response))
        }
        Err(err) => {
            {
                let mut stats = state.stats.lock().await;
                stats.requests_failed += 1;
            }
            timer.record_failure("none");
            Err(err)
        }
    }
}

/// Batch chat completions endpoint
///
/// POST /v1/batch/chat/completions
pub async fn batch_chat_completions(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ConductorError> {
    info!(
        requests = batch.requests.len(),
        wait_for_all = batch.wait_for_all,
        "Handling POST /v1/batch/chat/completions"
    );

    let mut issues: Vec<FieldIssue> = Vec::new();
    for (index, request) in batch.requests.iter().enumerate() {
        for issue in request.validate() {
            issues.push(FieldIssue::new(
                format!("requests[{index}].{}", issue.field),
                issue.message,
            ));
        }
    }
    if !issues.is_empty() {
        return Err(ConductorError::BadRequest { issues });
    }
    if state.ledger.is_empty() {
        return Err(ConductorError::NoProviders);
    }

    {
        let mut stats = state.stats.lock().await;
        stats.requests_total += batch.requests.len() as u64;
    }

    let response = state.batch.handle(batch.requests, batch.wait_for_all).await;

    {
        let mut stats = state.stats.lock().await;
        stats.requests_success += response.responses.iter().flatten().count() as u64;
        stats.requests_failed += response.failed.len() as u64;
        stats.tokens_consumed += response
            .responses
            .iter()
            .flatten()
            .filter_map(|r| r.usage)
            .map(|usage| usage.total_tokens as u64)
            .sum::<u64>();
    }

    Ok(Json(response))
}

/// List unified model names
///
/// GET /v1/models
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    debug!("Handling GET /v1/models");

    let data = state
        .registry
        .unified_models()
        .into_iter()
        .map(|id| ModelEntry { id, object: "model".to_string() })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
        default_model: DEFAULT_MODEL.to_string(),
    })
}
