//! Unified model name registry.
//!
//! Clients use provider-agnostic names like "llama-70b"; the registry
//! translates them to the provider-native identifier at dispatch time.
//! Unknown names pass through unchanged so clients may also send
//! provider-native names directly.

use std::collections::HashMap;

use crate::config::AppConfig;

/// Raised when a unified name is known but the selected provider has no
/// native identifier for it; the dispatcher skips that provider's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotSupported;

/// Maps unified model names to provider-native names.
///
/// Built-in defaults are overlaid with user-configured entries; the user
/// wins on collision. Immutable after load.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    mappings: HashMap<String, HashMap<String, String>>,
}

impl ModelRegistry {
    /// Build the registry from the built-in defaults plus the config overlay.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut mappings = builtin_mappings();
        for (unified, per_provider) in &config.models {
            let entry: HashMap<String, String> = per_provider
                .iter()
                .map(|(provider, native)| (provider.clone(), native.clone()))
                .collect();
            mappings.insert(unified.to_lowercase(), entry);
        }
        Self { mappings }
    }

    /// Resolve a unified name for a provider.
    ///
    /// Absent unified names pass through unchanged; a known unified name
    /// with no entry for this provider is `NotSupported`.
    pub fn resolve(&self, unified: &str, provider: &str) -> Result<String, NotSupported> {
        let normalized = unified.trim().to_lowercase();
        match self.mappings.get(&normalized) {
            Some(per_provider) => {
                per_provider.get(provider).cloned().ok_or(NotSupported)
            }
            None => Ok(unified.to_string()),
        }
    }

    /// Whether `provider` can serve `unified` (pass-through counts).
    pub fn supports(&self, unified: &str, provider: &str) -> bool {
        self.resolve(unified, provider).is_ok()
    }

    /// Unified names known to the registry, sorted for stable listing.
    pub fn unified_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mappings.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Built-in unified name map, matching the stock provider catalogs.
fn builtin_mappings() -> HashMap<String, HashMap<String, String>> {
    let entry = |pairs: &[(&str, &str)]| -> HashMap<String, String> {
        pairs.iter().map(|(p, m)| (p.to_string(), m.to_string())).collect()
    };

    let llama_33_70b = entry(&[
        ("cerebras", "llama-3.3-70b"),
        ("nvidia", "meta/llama-3.3-70b-instruct"),
    ]);
    let llama_31_8b = entry(&[
        ("cerebras", "llama3.1-8b"),
        ("nvidia", "meta/llama-3.1-8b-instruct"),
    ]);
    let llama_31_70b = entry(&[
        ("cerebras", "llama-3.1-70b"),
        ("nvidia", "meta/llama-3.1-70b-instruct"),
    ]);

    let mut mappings = HashMap::new();
    mappings.insert("llama-70b".to_string(), llama_33_70b.clone());
    mappings.insert("llama-3.3-70b".to_string(), llama_33_70b);
    mappings.insert("llama-8b".to_string(), llama_31_8b.clone());
    mappings.insert("llama-3.1-8b".to_string(), llama_31_8b);
    mappings.insert("llama-3.1-70b".to_string(), llama_31_70b);
    mappings
}
