//! Prometheus metrics for the conductor.
//!
//! Exposes metrics in Prometheus format for monitoring and observability.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for conductor metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Total requests counter with provider and status labels
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of requests")
            .namespace("conductor"),
        &["provider", "status"]
    ).expect("metric can be created");

    /// Request duration histogram with provider label
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Request duration in seconds"
        )
        .namespace("conductor")
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["provider"]
    ).expect("metric can be created");

    /// Active requests gauge (currently being dispatched)
    pub static ref ACTIVE_REQUESTS: Gauge = Gauge::with_opts(
        Opts::new("active_requests", "Number of requests currently being dispatched")
            .namespace("conductor")
    ).expect("metric can be created");

    // ============== Token Metrics ==============

    /// Total tokens billed against keys, by provider
    pub static ref TOKENS_CONSUMED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("tokens_consumed_total", "Total tokens consumed upstream")
            .namespace("conductor"),
        &["provider"]
    ).expect("metric can be created");

    // ============== Scheduling Metrics ==============

    /// Key rotations after a failed attempt
    pub static ref ROTATIONS_TOTAL: Counter = Counter::with_opts(
        Opts::new("rotations_total", "Total key rotations after failed attempts")
            .namespace("conductor")
    ).expect("metric can be created");

    /// Requests that timed out waiting for capacity
    pub static ref CAPACITY_TIMEOUTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("capacity_timeouts_total", "Total requests that timed out waiting for capacity")
            .namespace("conductor")
    ).expect("metric can be created");

    /// Keys currently available (both budgets positive, no cooldown)
    pub static ref KEYS_AVAILABLE: Gauge = Gauge::with_opts(
        Opts::new("keys_available", "Number of keys currently available")
            .namespace("conductor")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_REQUESTS.clone()))?;
    REGISTRY.register(Box::new(TOKENS_CONSUMED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROTATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CAPACITY_TIMEOUTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KEYS_AVAILABLE.clone()))?;
    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Helper struct for tracking request duration.
/// Counts as an error if dropped without an explicit record.
pub struct RequestTimer {
    start: std::time::Instant,
}

impl RequestTimer {
    /// Start a new request timer.
    pub fn new() -> Self {
        ACTIVE_REQUESTS.inc();
        Self { start: std::time::Instant::now() }
    }

    /// Record a successful request served by `provider`.
    pub fn record_success(self, provider: &str, tokens: u64) {
        let duration = self.start.elapsed().as_secs_f64();
        REQUEST_DURATION_SECONDS
            .with_label_values(&[provider])
            .observe(duration);
        REQUESTS_TOTAL
            .with_label_values(&[provider, "success"])
            .inc();
        TOKENS_CONSUMED_TOTAL
            .with_label_values(&[provider])
            .inc_by(tokens as f64);

        ACTIVE_REQUESTS.dec();
        std::mem::forget(self);
    }

    /// Record a failed request. `provider` is the last one tried, or "none"
    /// when the request never reached an upstream.
    pub fn record_failure(self, provider: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        REQUEST_DURATION_SECONDS
            .with_label_values(&[provider])
            .observe(duration);
        REQUESTS_TOTAL
            .with_label_values(&[provider, "error"])
            .inc();

        ACTIVE_REQUESTS.dec();
        std::mem::forget(self);
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        ACTIVE_REQUESTS.dec();
        REQUESTS_TOTAL.with_label_values(&["none", "error"]).inc();
    }
}

/// Record a key rotation after a failed attempt.
pub fn record_rotation() {
    ROTATIONS_TOTAL.inc();
}

/// Record a request that timed out waiting for capacity.
pub fn record_capacity_timeout() {
    CAPACITY_TIMEOUTS_TOTAL.inc();
}

/// Update the available-keys gauge.
pub fn set_keys_available(count: usize) {
    KEYS_AVAILABLE.set(count as f64);
}
