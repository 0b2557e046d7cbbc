//! Batch coordinator: fan a list of independent chat requests out over the
//! dispatcher with bounded parallelism.
//!
//! The concurrency ceiling is twice the key count, slightly oversubscribed
//! against the combined request budget so the pool stays saturated while
//! settles are in flight. Input order is preserved in the output; failures
//! leave a `null` at their position and an entry in `failed`.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::dispatcher::Dispatcher;
use crate::types::openai::{BatchFailure, BatchResponse, ChatCompletionRequest};

/// Executes batches of chat requests concurrently. Cheap to clone.
#[derive(Clone)]
pub struct BatchCoordinator {
    dispatcher: Dispatcher,
    max_concurrent: usize,
}

impl BatchCoordinator {
    /// Build a coordinator sized for `total_keys` pooled keys.
    pub fn new(dispatcher: Dispatcher, total_keys: usize) -> Self {
        Self { dispatcher, max_concurrent: (total_keys * 2).max(1) }
    }

    /// Concurrency ceiling for one batch.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Execute a batch.
    ///
    /// With `wait_for_all` unset, returns as soon as a majority (>50%) of
    /// positions completed; the remainder are aborted and their reservations
    /// settle through the cancellation path.
    pub async fn handle(
        &self,
        requests: Vec<ChatCompletionRequest>,
        wait_for_all: bool,
    ) -> BatchResponse {
        let started = std::time::Instant::now();
        let total = requests.len();

        let mut responses = Vec::with_capacity(total);
        responses.resize_with(total, || None);
        let mut failed: Vec<BatchFailure> = Vec::new();

        if total == 0 {
            return BatchResponse { responses, failed, total_time_ms: 0.0 };
        }

        info!(
            requests = total,
            wait_for_all,
            max_concurrent = self.max_concurrent,
            "Executing batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let dispatcher = self.dispatcher.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, dispatcher.handle(request).await)
            });
        }

        let needed = majority(total);
        let mut completed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(response))) => {
                    responses[index] = Some(response);
                    completed += 1;
                }
                Ok((index, Err(err))) => {
                    debug!(index, error = %err, "Batch position failed");
                    failed.push(BatchFailure { index, error: err.to_string() });
                    completed += 1;
                }
                Err(join_error) => {
                    // Aborted siblings after an early return, or a panicked
                    // dispatch task; neither has a position to record.
                    if !join_error.is_cancelled() {
                        error!(error = %join_error, "Batch task panicked");
                    }
                }
            }

            if !wait_for_all && completed >= needed {
                tasks.abort_all();
            }
        }

        let total_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            requests = total,
            succeeded = responses.iter().filter(|r| r.is_some()).count(),
            failed = failed.len(),
            total_time_ms = format!("{total_time_ms:.1}"),
            "Batch complete"
        );

        BatchResponse { responses, failed, total_time_ms }
    }
}

/// Smallest count strictly above half of `total`.
fn majority(total: usize) -> usize {
    total / 2 + 1
}
