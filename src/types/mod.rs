//! Wire types for the conductor API.
//!
//! - `openai`: OpenAI-compatible request/response types plus the conductor
//!   extensions (`provider`, `provider_key_name`) and the `/status` payloads.
//! - `provider`: the outbound upstream dialect and the lenient response
//!   shape the dispatcher interprets.

pub mod openai;
pub mod provider;
