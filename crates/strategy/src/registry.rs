use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::{MartingaleStrategy, RsiStrategy, Strategy};

/// Strategies by name. Built once at startup and read-only afterwards.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(MartingaleStrategy)
            .register(RsiStrategy)
    }

    /// Add a strategy under its own name. Later registrations replace earlier ones.
    pub fn register<S: Strategy + 'static>(mut self, strategy: S) -> Self {
        let key = strategy.name().to_lowercase();
        info!(strategy = %key, "Registered strategy");
        self.strategies.insert(key, Arc::new(strategy));
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(&name.to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["martingale", "rsi"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = StrategyRegistry::with_defaults();
        assert!(registry.get("Martingale").is_some());
        assert!(registry.get("RSI").is_some());
        assert!(registry.get("grid").is_none());
    }
}
