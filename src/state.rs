//! Application state for the conductor.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::batch::BatchCoordinator;
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::ledger::KeyLedger;
use crate::providers::{build_key_pool, provider_count};
use crate::registry::ModelRegistry;
use crate::selector::{SchedulingStrategy, Selector};

/// Application state shared across all handlers
pub struct AppState {
    /// Single-request dispatch engine
    pub dispatcher: Dispatcher,

    /// Batch fan-out over the dispatcher
    pub batch: BatchCoordinator,

    /// Key capacity authority
    pub ledger: Arc<KeyLedger>,

    /// Unified model name registry
    pub registry: Arc<ModelRegistry>,

    /// Active scheduling strategy, for `/status`
    pub strategy: SchedulingStrategy,

    /// Distinct providers contributing keys
    pub total_providers: usize,

    /// Runtime statistics
    pub stats: Mutex<ConductorStats>,
}

impl AppState {
    /// Create new application state from a loaded configuration.
    pub fn new(config: AppConfig) -> Self {
        let pool = build_key_pool(&config);
        let total_providers = provider_count(&pool);
        let strategy = config.conductor.scheduling_strategy;

        let registry = Arc::new(ModelRegistry::from_config(&config));
        let ledger = Arc::new(KeyLedger::new(&pool));
        let selector = Selector::new(strategy, pool.clone());
        let dispatcher = Dispatcher::new(
            config.conductor.clone(),
            Arc::clone(&ledger),
            selector,
            Arc::clone(&registry),
        );
        let batch = BatchCoordinator::new(dispatcher.clone(), pool.len());

        Self {
            dispatcher,
            batch,
            ledger,
            registry,
            strategy,
            total_providers,
            stats: Mutex::new(ConductorStats::default()),
        }
    }
}

/// Runtime statistics
#[derive(Debug, Default)]
pub struct ConductorStats {
    /// Total requests received
    pub requests_total: u64,

    /// Successful requests
    pub requests_success: u64,

    /// Failed requests
    pub requests_failed: u64,

    /// Total tokens billed against keys
    pub tokens_consumed: u64,
}

impl ConductorStats {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            1.0
        } else {
            self.requests_success as f64 / self.requests_total as f64
        }
    }
}
