//! Provider and key descriptors.
//!
//! Immutable configuration objects built once at startup. The key pool's
//! order (provider config order, then key config order) is the "config
//! order" every scheduling strategy refers back to.

use std::sync::Arc;

use crate::config::AppConfig;

/// Index of a key in the pool. Stable for the process lifetime; the ledger
/// and selector both address keys by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(pub usize);

/// Immutable configuration of one upstream provider.
#[derive(Debug)]
pub struct ProviderDescriptor {
    /// Provider identifier ("cerebras", "nvidia", ...)
    pub name: String,

    /// API root, e.g. "https://api.cerebras.ai/v1"
    pub base_url: String,

    /// Chat completions path appended to `base_url`
    pub chat_path: String,

    /// Disabled providers contribute no keys to the pool
    pub enabled: bool,
}

impl ProviderDescriptor {
    /// Full URL of the provider's chat completions endpoint.
    pub fn chat_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.chat_path)
    }
}

/// One API key belonging to one provider. Immutable after load.
#[derive(Debug)]
pub struct KeyDescriptor {
    /// Owning provider
    pub provider: Arc<ProviderDescriptor>,

    /// Friendly name, unique within the pool
    pub name: String,

    /// Secret key material
    pub api_key: String,

    /// Request budget per minute
    pub requests_per_minute: u32,

    /// Token budget per minute
    pub tokens_per_minute: u64,
}

/// Build the key pool from configuration.
///
/// Disabled providers and providers without keys are skipped; key names
/// default to `<provider>-key-<n>` as the original deployment convention.
pub fn build_key_pool(config: &AppConfig) -> Vec<Arc<KeyDescriptor>> {
    let mut pool = Vec::new();

    for (provider_name, provider_config) in &config.providers {
        if !provider_config.enabled || provider_config.keys.is_empty() {
            continue;
        }

        let descriptor = Arc::new(ProviderDescriptor {
            name: provider_name.clone(),
            base_url: provider_config.base_url.clone(),
            chat_path: provider_config.chat_path.clone(),
            enabled: provider_config.enabled,
        });

        for (i, key) in provider_config.keys.iter().enumerate() {
            let name = key
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-key-{}", provider_name, i + 1));

            pool.push(Arc::new(KeyDescriptor {
                provider: Arc::clone(&descriptor),
                name,
                api_key: key.api_key.clone(),
                requests_per_minute: key.requests_per_minute,
                tokens_per_minute: key.tokens_per_minute,
            }));
        }

        tracing::info!(
            provider = %provider_name,
            keys_count = provider_config.keys.len(),
            "Provider initialized"
        );
    }

    pool
}

/// Number of distinct providers represented in the pool.
pub fn provider_count(pool: &[Arc<KeyDescriptor>]) -> usize {
    let mut names: Vec<&str> = pool.iter().map(|k| k.provider.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    names.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, KeyConfig, ProviderConfig};
    use indexmap::IndexMap;

    fn key(api_key: &str) -> KeyConfig {
        KeyConfig {
            name: None,
            api_key: api_key.to_string(),
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
        }
    }

    fn provider(enabled: bool, keys: Vec<KeyConfig>) -> ProviderConfig {
        ProviderConfig {
            enabled,
            base_url: "https://example.invalid/v1".to_string(),
            chat_path: "/chat/completions".to_string(),
            keys,
        }
    }

    #[test]
    fn test_pool_order_and_default_names() {
        let mut providers = IndexMap::new();
        providers.insert("nvidia".to_string(), provider(true, vec![key("a"), key("b")]));
        providers.insert("cerebras".to_string(), provider(true, vec![key("c")]));
        let config = AppConfig { providers, ..Default::default() };

        let pool = build_key_pool(&config);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool[0].name, "nvidia-key-1");
        assert_eq!(pool[1].name, "nvidia-key-2");
        assert_eq!(pool[2].name, "cerebras-key-1");
        assert_eq!(provider_count(&pool), 2);
    }

    #[test]
    fn test_disabled_and_empty_providers_skipped() {
        let mut providers = IndexMap::new();
        providers.insert("cerebras".to_string(), provider(false, vec![key("a")]));
        providers.insert("nvidia".to_string(), provider(true, vec![]));
        let config = AppConfig { providers, ..Default::default() };

        assert!(build_key_pool(&config).is_empty());
    }

    #[test]
    fn test_chat_url_joins_cleanly() {
        let descriptor = ProviderDescriptor {
            name: "cerebras".to_string(),
            base_url: "https://api.cerebras.ai/v1/".to_string(),
            chat_path: "/chat/completions".to_string(),
            enabled: true,
        };
        assert_eq!(descriptor.chat_url(), "https://api.cerebras.ai/v1/chat/completions");
    }
}
