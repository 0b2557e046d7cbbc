//! Configuration for the conductor.
//!
//! Two layers, mirroring how the service is deployed:
//! - `Settings`: process-level knobs from `CONDUCTOR_*` environment variables
//!   (host, port, log level, config path).
//! - `AppConfig`: the YAML document describing the conductor policy, model
//!   overlays and provider key pools.
//!
//! Provider and model maps are `IndexMap`s: YAML order is load-bearing (it
//! defines the selector's config order).

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::selector::SchedulingStrategy;

/// Application settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Log level ("DEBUG", "INFO", ...)
    pub log_level: String,

    /// Path to the YAML configuration file
    pub config_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            log_level: "INFO".to_string(),
            config_path: "./config/config.yaml".to_string(),
        }
    }
}

impl Settings {
    /// Create settings from `CONDUCTOR_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("CONDUCTOR_HOST").unwrap_or(defaults.host),
            port: std::env::var("CONDUCTOR_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            log_level: std::env::var("CONDUCTOR_LOG_LEVEL").unwrap_or(defaults.log_level),
            config_path: std::env::var("CONDUCTOR_CONFIG_PATH").unwrap_or(defaults.config_path),
        }
    }
}

/// The full YAML configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Conductor policy block
    #[serde(default)]
    pub conductor: ConductorConfig,

    /// User model overlay: unified name -> provider -> native name.
    /// Entries here win over the built-in map on collision.
    #[serde(default)]
    pub models: IndexMap<String, IndexMap<String, String>>,

    /// Providers in priority order; order defines the selector's config order.
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
}

/// Scheduling and retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Key selection strategy
    pub scheduling_strategy: SchedulingStrategy,

    /// Upstream hard deadline and RESERVE wait budget, in seconds
    pub request_timeout: u64,

    /// Maximum distinct-key call attempts per request
    pub max_retries: u32,

    /// Delay between rotation attempts, in seconds (not before the first)
    pub retry_delay: f64,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            scheduling_strategy: SchedulingStrategy::RoundRobin,
            request_timeout: 120,
            max_retries: 3,
            retry_delay: 1.0,
        }
    }
}

/// Configuration for one upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Disabled providers contribute no keys
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Provider API root, e.g. "https://api.cerebras.ai/v1"
    pub base_url: String,

    /// Chat completions path appended to `base_url`
    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    /// API keys in priority order
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// Configuration for a single API key.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyConfig {
    /// Optional friendly name; defaults to `<provider>-key-<n>`
    #[serde(default)]
    pub name: Option<String>,

    /// Secret key material
    pub api_key: String,

    /// Request budget per minute
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    /// Token budget per minute
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_chat_path() -> String {
    "/chat/completions".to_string()
}

fn default_rpm() -> u32 {
    60
}

fn default_tpm() -> u64 {
    100_000
}

/// Load configuration from a YAML file.
///
/// A missing file is not an error: the default document (both stock providers
/// enabled, zero keys) is returned so the server can come up and answer
/// `/health` while operators add keys.
pub fn load_config(config_path: &str) -> anyhow::Result<AppConfig> {
    let path = Path::new(config_path);
    if !path.exists() {
        tracing::warn!(path = %config_path, "Config file not found, using defaults");
        return Ok(default_config());
    }

    let raw = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&raw)?;
    Ok(config)
}

/// The default configuration document.
pub fn default_config() -> AppConfig {
    let mut providers = IndexMap::new();
    providers.insert(
        "cerebras".to_string(),
        ProviderConfig {
            enabled: true,
            base_url: "https://api.cerebras.ai/v1".to_string(),
            chat_path: default_chat_path(),
            keys: Vec::new(),
        },
    );
    providers.insert(
        "nvidia".to_string(),
        ProviderConfig {
            enabled: true,
            base_url: "https://integrate.api.nvidia.com/v1".to_string(),
            chat_path: default_chat_path(),
            keys: Vec::new(),
        },
    );

    AppConfig { conductor: ConductorConfig::default(), models: IndexMap::new(), providers }
}
