//! Metrics module for the conductor.
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use prometheus::{
    encode_metrics, record_capacity_timeout, record_rotation, register_metrics,
    set_keys_available, RequestTimer, ACTIVE_REQUESTS, REQUESTS_TOTAL, ROTATIONS_TOTAL,
};
