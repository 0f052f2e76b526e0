use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use common::ExchangeFactory;

/// Exchange factories by lowercase name. Built once at startup.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    factories: HashMap<String, Arc<dyn ExchangeFactory>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F: ExchangeFactory + 'static>(self, factory: F) -> Self {
        self.register_arc(Arc::new(factory))
    }

    pub fn register_arc(mut self, factory: Arc<dyn ExchangeFactory>) -> Self {
        let key = factory.name().to_lowercase();
        info!(exchange = %key, "Registered exchange");
        self.factories.insert(key, factory);
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExchangeFactory>> {
        self.factories.get(&name.to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
