//! Request dispatcher: fulfills one chat request end to end.
//!
//! Per request the dispatcher resolves the model, obtains an ordered
//! candidate list from the selector, reserves capacity against the first
//! key the ledger will grant, translates to the provider dialect, executes
//! the upstream call and interprets the outcome: rotating to the next key
//! on 429/5xx/network faults, surfacing client faults immediately, and
//! waiting on the ledger when every key is exhausted.

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ConductorConfig;
use crate::error::ConductorError;
use crate::ledger::{KeyLedger, PenaltyReason, Reservation};
use crate::metrics;
use crate::providers::KeyId;
use crate::registry::ModelRegistry;
use crate::selector::Selector;
use crate::types::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::types::provider::{ProviderChatRequest, ProviderChatResponse};

/// Outcome of a single keyed attempt.
enum Attempt {
    Done(ChatCompletionResponse),
    /// Recoverable: try the next key
    Rotate(ConductorError),
    /// Client fault: rotating will not help
    Fail(ConductorError),
}

/// Dispatches chat requests across the key pool. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    client: reqwest::Client,
    ledger: Arc<KeyLedger>,
    selector: Selector,
    registry: Arc<ModelRegistry>,
    policy: ConductorConfig,
}

impl Dispatcher {
    pub fn new(
        policy: ConductorConfig,
        ledger: Arc<KeyLedger>,
        selector: Selector,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(policy.request_timeout))
            .build()
            .expect("Failed to create HTTP client");

        Self { inner: Arc::new(DispatcherInner { client, ledger, selector, registry, policy }) }
    }

    /// Fulfill one chat request.
    pub async fn handle(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ConductorError> {
        let inner = &self.inner;

        if inner.ledger.is_empty() {
            return Err(ConductorError::NoProviders);
        }

        let model = request.model().to_string();
        let estimated_tokens = estimate_tokens(&request);
        let deadline = Instant::now() + Duration::from_secs(inner.policy.request_timeout);
        let retry_delay = Duration::from_secs_f64(inner.policy.retry_delay.max(0.0));
        let max_attempts = inner.policy.max_retries.max(1);

        let mut attempts = 0u32;
        let mut last_error: Option<ConductorError> = None;

        loop {
            let candidates = inner.selector.candidates(
                &inner.ledger,
                request.provider.as_deref(),
                |provider| inner.registry.supports(&model, provider),
            );

            if candidates.is_empty() {
                // No key can ever serve this request: forced provider not
                // configured, or the model is unsupported everywhere.
                return Err(last_error.take().unwrap_or(ConductorError::NoProviders));
            }

            let mut reserved_any = false;
            for key in candidates {
                let Some(reservation) = inner.ledger.try_reserve(key, estimated_tokens) else {
                    continue;
                };
                reserved_any = true;

                if attempts > 0 {
                    metrics::record_rotation();
                    tokio::time::sleep(retry_delay).await;
                }
                attempts += 1;

                match self.attempt(key, reservation, &request, &model).await {
                    Attempt::Done(response) => return Ok(response),
                    Attempt::Fail(err) => return Err(err),
                    Attempt::Rotate(err) => {
                        if attempts >= max_attempts {
                            return Err(err);
                        }
                        last_error = Some(err);
                    }
                }
            }

            // List exhausted without a dispatch; park until a settle, a
            // refill or a cooldown expiry may have freed capacity, then
            // re-enter selection.
            if !reserved_any && !inner.ledger.wait_for_capacity(deadline).await {
                metrics::record_capacity_timeout();
                return Err(ConductorError::CapacityTimeout);
            }
        }
    }

    /// One reserve-translate-call-interpret pass against a single key.
    async fn attempt(
        &self,
        key: KeyId,
        reservation: Reservation,
        request: &ChatCompletionRequest,
        model: &str,
    ) -> Attempt {
        let inner = &self.inner;
        let descriptor = Arc::clone(inner.ledger.descriptor(key));
        let provider = &descriptor.provider;
        let estimated = reservation.tokens_estimated();

        // TRANSLATE. Candidates are pre-filtered on model support, so a miss
        // here means the call never leaves: refund in full and move on.
        let native_model = match inner.registry.resolve(model, &provider.name) {
            Ok(native) => native,
            Err(_) => {
                reservation.release();
                return Attempt::Rotate(ConductorError::upstream(format!(
                    "model {model} is not supported by {}",
                    provider.name
                )));
            }
        };
        let body = build_upstream_body(request, native_model.clone());

        info!(
            provider = %provider.name,
            key = %descriptor.name,
            model = %native_model,
            messages = request.messages.len(),
            "Dispatching chat completion"
        );

        // CALL
        let result = inner
            .client
            .post(provider.chat_url())
            .bearer_auth(&descriptor.api_key)
            .json(&body)
            .send()
            .await;

        // INTERPRET
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(provider = %provider.name, key = %descriptor.name, error = %e, "Upstream call failed");
                inner.ledger.penalize(key, PenaltyReason::Network);
                reservation.settle(estimated);
                return Attempt::Rotate(ConductorError::upstream(format!(
                    "{}: {e}",
                    provider.name
                )));
            }
        };

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(
                provider = %provider.name,
                key = %descriptor.name,
                retry_after_secs = retry_after.map(|d| d.as_secs()),
                "Key rate limited upstream"
            );
            inner.ledger.penalize(key, PenaltyReason::Http429 { retry_after });
            reservation.settle(estimated);
            return Attempt::Rotate(ConductorError::upstream(format!(
                "{} rate limited key {}",
                provider.name, descriptor.name
            )));
        }

        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            error!(provider = %provider.name, key = %descriptor.name, status = status.as_u16(), "Upstream server error");
            inner.ledger.penalize(key, PenaltyReason::Http5xx);
            reservation.settle(estimated);
            return Attempt::Rotate(ConductorError::upstream(format!(
                "{} returned {status}: {message}",
                provider.name
            )));
        }

        if status.is_client_error() {
            // The request itself is at fault; another key will reject it the
            // same way. Pass the provider's message through, no penalty.
            let message = response.text().await.unwrap_or_default();
            warn!(provider = %provider.name, status = status.as_u16(), "Upstream rejected request");
            reservation.settle(estimated);
            let message = if message.is_empty() { status.to_string() } else { message };
            return Attempt::Fail(ConductorError::UpstreamClient {
                status: status.as_u16(),
                message,
            });
        }

        match response.json::<ProviderChatResponse>().await {
            Ok(parsed) => {
                let actual = parsed
                    .usage
                    .map(|usage| usage.total_tokens as u64)
                    .unwrap_or(estimated);
                reservation.settle(actual);
                inner.ledger.note_success(key);
                debug!(
                    provider = %provider.name,
                    key = %descriptor.name,
                    tokens = actual,
                    "Chat completion served"
                );
                Attempt::Done(augment_response(parsed, native_model, &provider.name, &descriptor.name))
            }
            Err(e) => {
                error!(provider = %provider.name, error = %e, "Unparseable 2xx body");
                inner.ledger.penalize(key, PenaltyReason::Http5xx);
                reservation.settle(estimated);
                Attempt::Rotate(ConductorError::upstream(format!(
                    "{} returned an unparseable body: {e}",
                    provider.name
                )))
            }
        }
    }
}

/// Pre-call token estimate: prompt characters at four per token, rounded up,
/// plus the full generation budget. The settle step corrects from reported
/// usage.
pub fn estimate_tokens(request: &ChatCompletionRequest) -> u64 {
    let chars: u64 = request
        .messages
        .iter()
        .map(|m| m.content.chars().count() as u64)
        .sum();
    chars.div_ceil(4) + request.max_tokens() as u64
}

/// Build the outbound provider body: native model, resolved sampling
/// defaults, conductor extensions stripped.
pub fn build_upstream_body(
    request: &ChatCompletionRequest,
    native_model: String,
) -> ProviderChatRequest {
    ProviderChatRequest {
        model: native_model,
        messages: request.messages.clone(),
        temperature: request.temperature(),
        max_tokens: request.max_tokens(),
        top_p: request.top_p(),
        stop: request.stop.clone(),
        extra: request.extra.clone(),
    }
}

/// Fill response gaps and stamp the conductor extensions.
fn augment_response(
    parsed: ProviderChatResponse,
    native_model: String,
    provider: &str,
    key_name: &str,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: parsed
            .id
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4())),
        object: parsed.object.unwrap_or_else(|| "chat.completion".to_string()),
        created: parsed.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        model: parsed.model.unwrap_or(native_model),
        choices: parsed.choices,
        usage: parsed.usage,
        provider: provider.to_string(),
        provider_key_name: key_name.to_string(),
        extra: parsed.extra,
    }
}
