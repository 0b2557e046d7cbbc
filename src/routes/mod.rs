//! HTTP route handlers for the conductor.
//!
//! This module organizes all route handlers:
//! - `health`: health, status and metrics endpoints
//! - `openai`: OpenAI-compatible chat, batch and model endpoints

pub mod health;
pub mod openai;

// Re-export handlers for convenience
pub use health::{health, metrics, metrics_prometheus, status};
pub use openai::{batch_chat_completions, chat_completions, list_models};
