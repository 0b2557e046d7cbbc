//! Key selection strategies.
//!
//! Given the pool and a strategy, the selector produces an ordered preference
//! list of keys for the dispatcher to try. Availability is deliberately NOT
//! pre-filtered here: the dispatcher checks per-attempt through the ledger so
//! freshly refilled keys become usable without a refresh pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ledger::KeyLedger;
use crate::providers::{KeyDescriptor, KeyId};

/// Available scheduling strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Rotate over all keys for fairness across providers
    #[default]
    RoundRobin,

    /// Prefer the key with the most headroom on its scarcer budget
    LeastLoaded,

    /// Strict config order; later keys only when earlier ones are unavailable
    Sequential,
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingStrategy::RoundRobin => write!(f, "round_robin"),
            SchedulingStrategy::LeastLoaded => write!(f, "least_loaded"),
            SchedulingStrategy::Sequential => write!(f, "sequential"),
        }
    }
}

/// Produces ordered candidate lists over the key pool.
///
/// The rotation cursor is the only cross-request mutable state outside the
/// ledger; a relaxed atomic increment is all the rigor it needs.
pub struct Selector {
    strategy: SchedulingStrategy,
    keys: Vec<Arc<KeyDescriptor>>,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: SchedulingStrategy, keys: Vec<Arc<KeyDescriptor>>) -> Self {
        Self { strategy, keys, cursor: AtomicUsize::new(0) }
    }

    /// Ordered preference list for one selection pass.
    ///
    /// Filters: when `forced_provider` is set only that provider's keys
    /// remain, and providers failing the `supports` predicate (model not
    /// mapped for them) are omitted.
    pub fn candidates(
        &self,
        ledger: &KeyLedger,
        forced_provider: Option<&str>,
        supports: impl Fn(&str) -> bool,
    ) -> Vec<KeyId> {
        if self.keys.is_empty() {
            return Vec::new();
        }

        let eligible = |id: usize| {
            let key = &self.keys[id];
            if let Some(forced) = forced_provider {
                if key.provider.name != forced {
                    return false;
                }
            }
            supports(&key.provider.name)
        };

        match self.strategy {
            SchedulingStrategy::RoundRobin => {
                let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.keys.len();
                (0..self.keys.len())
                    .map(|offset| (start + offset) % self.keys.len())
                    .filter(|&id| eligible(id))
                    .map(KeyId)
                    .collect()
            }
            SchedulingStrategy::LeastLoaded => {
                let mut scored: Vec<(usize, f64, u64)> = (0..self.keys.len())
                    .filter(|&id| eligible(id))
                    .map(|id| {
                        let (score, tokens_remaining) = ledger.load_factor(KeyId(id));
                        (id, score, tokens_remaining)
                    })
                    .collect();

                // Scarcer-budget headroom descending, absolute tokens
                // descending, then config order.
                scored.sort_by(|a, b| {
                    b.1.total_cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0))
                });
                scored.into_iter().map(|(id, _, _)| KeyId(id)).collect()
            }
            SchedulingStrategy::Sequential => {
                (0..self.keys.len()).filter(|&id| eligible(id)).map(KeyId).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderDescriptor;

    fn pool(layout: &[(&str, usize)]) -> Vec<Arc<KeyDescriptor>> {
        let mut keys = Vec::new();
        for (provider_name, count) in layout {
            let provider = Arc::new(ProviderDescriptor {
                name: provider_name.to_string(),
                base_url: format!("https://{provider_name}.invalid/v1"),
                chat_path: "/chat/completions".to_string(),
                enabled: true,
            });
            for i in 0..*count {
                keys.push(Arc::new(KeyDescriptor {
                    provider: Arc::clone(&provider),
                    name: format!("{provider_name}-key-{}", i + 1),
                    api_key: format!("{provider_name}-secret-{i}"),
                    requests_per_minute: 30,
                    tokens_per_minute: 60_000,
                }));
            }
        }
        keys
    }

    fn names(selector: &Selector, ids: &[KeyId]) -> Vec<String> {
        ids.iter().map(|id| selector.keys[id.0].name.clone()).collect()
    }

    #[tokio::test]
    async fn test_round_robin_rotates_start() {
        let keys = pool(&[("cerebras", 2), ("nvidia", 1)]);
        let ledger = KeyLedger::new(&keys);
        let selector = Selector::new(SchedulingStrategy::RoundRobin, keys);

        let first = selector.candidates(&ledger, None, |_| true);
        let second = selector.candidates(&ledger, None, |_| true);
        let third = selector.candidates(&ledger, None, |_| true);
        let fourth = selector.candidates(&ledger, None, |_| true);

        assert_eq!(first, vec![KeyId(0), KeyId(1), KeyId(2)]);
        assert_eq!(second, vec![KeyId(1), KeyId(2), KeyId(0)]);
        assert_eq!(third, vec![KeyId(2), KeyId(0), KeyId(1)]);
        // Cursor wraps back around.
        assert_eq!(fourth, first);
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        // With N equally limited keys, 10*N selections spread the first
        // choice evenly across all keys.
        let n = 4;
        let keys = pool(&[("cerebras", n)]);
        let ledger = KeyLedger::new(&keys);
        let selector = Selector::new(SchedulingStrategy::RoundRobin, keys);

        let mut first_choice_counts = vec![0usize; n];
        for _ in 0..10 * n {
            let list = selector.candidates(&ledger, None, |_| true);
            first_choice_counts[list[0].0] += 1;
        }

        for count in first_choice_counts {
            assert_eq!(count, 10);
        }
    }

    #[tokio::test]
    async fn test_sequential_is_config_order() {
        let keys = pool(&[("cerebras", 2), ("nvidia", 2)]);
        let ledger = KeyLedger::new(&keys);
        let selector = Selector::new(SchedulingStrategy::Sequential, keys);

        for _ in 0..3 {
            let list = selector.candidates(&ledger, None, |_| true);
            assert_eq!(list, vec![KeyId(0), KeyId(1), KeyId(2), KeyId(3)]);
        }
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_headroom() {
        let keys = pool(&[("cerebras", 3)]);
        let ledger = std::sync::Arc::new(KeyLedger::new(&keys));
        let selector = Selector::new(SchedulingStrategy::LeastLoaded, keys);

        // Drain key 0 hardest, key 1 a little.
        for _ in 0..10 {
            ledger.try_reserve(KeyId(0), 100).unwrap().settle(100);
        }
        ledger.try_reserve(KeyId(1), 100).unwrap().settle(100);

        let list = selector.candidates(&ledger, None, |_| true);
        assert_eq!(list, vec![KeyId(2), KeyId(1), KeyId(0)]);
    }

    #[tokio::test]
    async fn test_least_loaded_tie_breaks_by_config_order() {
        let keys = pool(&[("cerebras", 2)]);
        let ledger = KeyLedger::new(&keys);
        let selector = Selector::new(SchedulingStrategy::LeastLoaded, keys);

        let list = selector.candidates(&ledger, None, |_| true);
        assert_eq!(list, vec![KeyId(0), KeyId(1)]);
    }

    #[tokio::test]
    async fn test_forced_provider_filter() {
        let keys = pool(&[("cerebras", 2), ("nvidia", 2)]);
        let ledger = KeyLedger::new(&keys);
        let selector = Selector::new(SchedulingStrategy::RoundRobin, keys);

        let list = selector.candidates(&ledger, Some("nvidia"), |_| true);
        assert_eq!(
            names(&selector, &list),
            vec!["nvidia-key-1".to_string(), "nvidia-key-2".to_string()]
        );

        let list = selector.candidates(&ledger, Some("groq"), |_| true);
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_provider_filter() {
        let keys = pool(&[("cerebras", 1), ("nvidia", 1)]);
        let ledger = KeyLedger::new(&keys);
        let selector = Selector::new(SchedulingStrategy::Sequential, keys);

        let list = selector.candidates(&ledger, None, |provider| provider == "nvidia");
        assert_eq!(names(&selector, &list), vec!["nvidia-key-1".to_string()]);
    }

    #[test]
    fn test_strategy_display_and_parse() {
        assert_eq!(SchedulingStrategy::RoundRobin.to_string(), "round_robin");
        let parsed: SchedulingStrategy = serde_yaml::from_str("least_loaded").unwrap();
        assert_eq!(parsed, SchedulingStrategy::LeastLoaded);
    }
}
