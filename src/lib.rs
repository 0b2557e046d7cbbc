//! TrainForge Conductor
//!
//! Multi-provider LLM API conductor: multiplexes a single OpenAI-compatible
//! chat-completions endpoint across multiple upstream providers and API
//! keys, combining their per-key rate-limit budgets into one larger
//! effective budget with transparent failover.
//!
//! This library provides the scheduling, rate-accounting and dispatch
//! engine; it can be used either as the standalone `trainforge-conductor`
//! binary or embedded behind another HTTP surface.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod providers;
pub mod registry;
pub mod routes;
pub mod selector;
pub mod state;
pub mod types;

pub use config::{AppConfig, Settings};
pub use state::AppState;

/// Server configuration for the conductor
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Loaded YAML configuration
    pub config: AppConfig,
    /// Whether to print the banner on startup
    pub print_banner: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            config: config::default_config(),
            print_banner: true,
        }
    }
}

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the conductor's router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and observability
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/batch/chat/completions", post(routes::batch_chat_completions))
        .route("/v1/models", get(routes::list_models))
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the conductor server.
///
/// This function starts the HTTP server and blocks until it's shut down.
pub async fn run_server(server: ServerConfig) -> anyhow::Result<()> {
    init_metrics();

    info!(
        host = %server.host,
        port = server.port,
        "Starting TrainForge Conductor v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = Arc::new(AppState::new(server.config.clone()));

    if state.ledger.is_empty() {
        warn!("No providers configured! Add API keys to config/config.yaml");
    } else {
        info!(
            providers = state.total_providers,
            keys = state.ledger.len(),
            strategy = %state.strategy,
            "Key pool ready"
        );
    }

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("TrainForge Conductor listening on http://{}", addr);
    info!("Chat API:  http://{}/v1/chat/completions", addr);
    info!("Batch API: http://{}/v1/batch/chat/completions", addr);
    info!("Status:    http://{}/status", addr);

    if server.print_banner {
        print_banner(&server, &state);
    }

    axum::serve(listener, app).await?;

    Ok(())
}

/// Print the startup banner
fn print_banner(server: &ServerConfig, state: &Arc<AppState>) {
    let addr = format!("{}:{}", server.host, server.port);

    println!();
    println!("==================================================");
    println!("  TrainForge Conductor v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://{}", addr);
    println!();
    println!("  Scheduling:");
    println!("    Strategy: {}", state.strategy);
    println!(
        "    Request timeout: {}s, max retries: {}, retry delay: {}s",
        server.config.conductor.request_timeout,
        server.config.conductor.max_retries,
        server.config.conductor.retry_delay
    );
    println!();
    println!("  Key pool:");
    if state.ledger.is_empty() {
        println!("    No keys configured (chat requests will return 503)");
        println!("    Add API keys to config/config.yaml");
    } else {
        for key in state.ledger.snapshot() {
            println!(
                "    {}/{}: {} req/min, {} tokens/min",
                key.provider, key.key_name, key.requests_per_minute, key.tokens_per_minute
            );
        }
    }
    println!();
    println!("  Endpoints:");
    println!("    Chat:   POST /v1/chat/completions");
    println!("    Batch:  POST /v1/batch/chat/completions");
    println!("    Models: GET  /v1/models");
    println!("    Status: GET  /status, /health");
    println!("    Prometheus: GET /metrics/prometheus");
    println!("==================================================");
    println!();
}
